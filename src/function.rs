//! Callables: user-defined functions, bound methods, built-in functions,
//! and closure cells.
//!
//! Grounded on the teacher's `function.rs` (`PyFunction`, `FuncArgs`,
//! argument-binding via `fill_locals_from_args`) and `builtins/builtinfunc.rs`
//! (`PyBuiltinFunction`/`PyNativeFuncDef` as a plain Rust fn pointer).

use crate::bytecode::CodeObject;
use crate::value::PyObjectRef;
use crate::vm::{PyResult, VirtualMachine};
use std::cell::RefCell;
use std::rc::Rc;

/// A closure cell: a one-slot mutable box shared between a defining scope
/// and the inner scopes that close over it (spec.md §4.5 "Closures").
#[derive(Clone)]
pub struct PyCell(pub Rc<RefCell<Option<PyObjectRef>>>);

impl PyCell {
    pub fn new(initial: Option<PyObjectRef>) -> Self {
        PyCell(Rc::new(RefCell::new(initial)))
    }

    pub fn get(&self) -> Option<PyObjectRef> {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: PyObjectRef) {
        *self.0.borrow_mut() = Some(value);
    }
}

/// A user-defined function: its code, the globals dict it closes over at
/// module scope, default argument values, and captured closure cells.
pub struct PyFunction {
    pub name: Rc<str>,
    pub code: Rc<CodeObject>,
    pub globals: PyObjectRef,
    pub defaults: Vec<PyObjectRef>,
    pub kwonly_defaults: Vec<(Rc<str>, PyObjectRef)>,
    /// One cell per `code.freevars` entry, supplied by `MAKE_FUNCTION`'s
    /// closure tuple.
    pub closure: Vec<PyCell>,
}

/// `instance.method` — the result of the descriptor protocol's simplified
/// form (spec.md §4.1 design note): binding a plain function found via
/// attribute lookup on an instance produces this, with `self` prepended
/// automatically on call.
pub struct PyBoundMethod {
    pub receiver: PyObjectRef,
    pub function: PyObjectRef,
}

pub type BuiltinMethod = fn(&VirtualMachine, FuncArgs) -> PyResult<PyObjectRef>;

/// A builtin implemented directly in Rust, grounded on the teacher's
/// `PyNativeFuncDef`: a plain function pointer rather than a boxed
/// trait object, since every builtin here has the same signature.
pub struct PyBuiltinFunction {
    pub name: Rc<str>,
    pub func: BuiltinMethod,
}

/// Fully resolved call arguments after the call protocol has gathered
/// positional/`*args`/keyword/`**kwargs` values off the operand stack but
/// before they've been bound to a particular function's parameter list.
#[derive(Default, Clone)]
pub struct FuncArgs {
    pub args: Vec<PyObjectRef>,
    pub kwargs: Vec<(Rc<str>, PyObjectRef)>,
}

impl FuncArgs {
    pub fn new(args: Vec<PyObjectRef>) -> Self {
        FuncArgs { args, kwargs: Vec::new() }
    }

    pub fn get_kwarg(&self, name: &str) -> Option<PyObjectRef> {
        self.kwargs.iter().find(|(n, _)| &**n == name).map(|(_, v)| v.clone())
    }
}

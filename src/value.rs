//! The runtime value model (spec.md §3).
//!
//! `Value` is the tagged variant spec.md requires; `PyObject` is the single
//! heap allocation every value lives in, and `PyObjectRef` (`Rc<PyObject>`)
//! is the handle the rest of the VM passes around. Using one ref-counted
//! wrapper for every variant — rather than the teacher's trait-object
//! `Box<dyn PyObjectPayload>` payload — gives pointer identity uniformly
//! for free (`is`/`is not`, small-int interning) while still matching the
//! teacher's "every object is a `PyObjectRef`, classes look objects up by
//! MRO" architecture.

use crate::class::{PyClass, PyInstance};
use crate::dict::{PyDict, PySet};
use crate::exceptions::PyExceptionObj;
use crate::function::{PyBoundMethod, PyBuiltinFunction, PyCell, PyFunction};
use crate::generator::GeneratorTask;
use crate::iterator::PyIteratorState;
use crate::module::PyModule;
use num_bigint::BigInt;
use num_complex::Complex64;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A half-open arithmetic range `start..stop` stepping by `step`, matching
/// `range()`. Kept as plain `BigInt`s so huge ranges don't need to
/// materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyRange {
    pub start: BigInt,
    pub stop: BigInt,
    pub step: BigInt,
}

impl PyRange {
    /// Number of elements `range(start, stop, step)` produces.
    pub fn len(&self) -> BigInt {
        if self.step.sign() == num_bigint::Sign::Minus {
            if self.start <= self.stop {
                BigInt::from(0)
            } else {
                (&self.start - &self.stop - 1) / (-&self.step) + 1
            }
        } else if self.step.sign() == num_bigint::Sign::NoSign {
            BigInt::from(0)
        } else if self.start >= self.stop {
            BigInt::from(0)
        } else {
            (&self.stop - &self.start - 1) / &self.step + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == BigInt::from(0)
    }

    pub fn nth(&self, i: &BigInt) -> BigInt {
        &self.start + i * &self.step
    }
}

/// The tagged variant spec.md §3 requires.
pub enum Value {
    None,
    Bool(bool),
    Int(BigInt),
    Float(f64),
    Complex(Complex64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    List(RefCell<Vec<PyObjectRef>>),
    Tuple(Rc<[PyObjectRef]>),
    Dict(RefCell<PyDict>),
    Set(RefCell<PySet>),
    FrozenSet(Rc<PySet>),
    Range(PyRange),
    Class(Rc<PyClass>),
    Instance(PyInstance),
    Function(Rc<PyFunction>),
    BoundMethod(Rc<PyBoundMethod>),
    BuiltinFunction(Rc<PyBuiltinFunction>),
    Cell(PyCell),
    Iterator(RefCell<PyIteratorState>),
    Generator(Rc<GeneratorTask>),
    Coroutine(Rc<GeneratorTask>),
    Module(Rc<PyModule>),
    Exception(RefCell<PyExceptionObj>),
    /// `staticmethod(f)`: attribute lookup returns `f` itself, unbound,
    /// whether accessed on the class or an instance.
    StaticMethod(PyObjectRef),
    /// `classmethod(f)`: attribute lookup returns `f` bound to the class
    /// (not the instance), even when accessed through an instance.
    ClassMethod(PyObjectRef),
    /// Wraps a nested code object between `LoadConst` and `MakeFunction`;
    /// not a spec.md table entry but required plumbing for §4.2's
    /// `make-function` opcode to have something to pop off the stack.
    Code(Rc<crate::bytecode::CodeObject>),
    /// The `NotImplemented` sentinel (glossary); identity-significant like
    /// `None`/`True`/`False`.
    NotImplemented,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Complex(c) => write!(f, "{c}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b{b:?}"),
            Value::List(_) => write!(f, "<list>"),
            Value::Tuple(t) => write!(f, "<tuple len={}>", t.len()),
            Value::Dict(_) => write!(f, "<dict>"),
            Value::Set(_) => write!(f, "<set>"),
            Value::FrozenSet(_) => write!(f, "<frozenset>"),
            Value::Range(r) => write!(f, "range({}, {}, {})", r.start, r.stop, r.step),
            Value::Class(c) => write!(f, "<class {}>", c.name),
            Value::Instance(i) => write!(f, "<{} instance>", i.class.name),
            Value::Function(fun) => write!(f, "<function {}>", fun.name),
            Value::BoundMethod(_) => write!(f, "<bound method>"),
            Value::BuiltinFunction(b) => write!(f, "<built-in function {}>", b.name),
            Value::Cell(_) => write!(f, "<cell>"),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Generator(_) => write!(f, "<generator>"),
            Value::Coroutine(_) => write!(f, "<coroutine>"),
            Value::Module(m) => write!(f, "<module {}>", m.name),
            Value::Exception(e) => write!(f, "<exception {}>", e.borrow().type_name),
            Value::StaticMethod(_) => write!(f, "<staticmethod>"),
            Value::ClassMethod(_) => write!(f, "<classmethod>"),
            Value::Code(c) => write!(f, "{c}"),
            Value::NotImplemented => write!(f, "NotImplemented"),
        }
    }
}

/// The one allocation every runtime value lives behind. `class` is a
/// reference to the value's type object (used for MRO walks, `type()`,
/// `isinstance`); it is `None` only for the handful of values that are
/// bootstrapped before the class registry itself exists (see
/// `builtins_core::bootstrap`).
pub struct PyObject {
    pub value: Value,
    pub class: RefCell<Option<PyObjectRef>>,
}

pub type PyObjectRef = Rc<PyObject>;

impl PyObject {
    pub fn new(value: Value, class: Option<PyObjectRef>) -> PyObjectRef {
        Rc::new(PyObject {
            value,
            class: RefCell::new(class),
        })
    }
}

/// Two values are identical iff they are the same heap object (spec.md §3
/// "Identity").
pub fn is_identical(a: &PyObjectRef, b: &PyObjectRef) -> bool {
    Rc::ptr_eq(a, b)
}

impl fmt::Debug for PyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

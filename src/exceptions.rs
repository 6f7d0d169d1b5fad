//! Exception objects and the built-in exception class hierarchy.
//!
//! Grounded on the teacher's `vm/exceptions.rs` (`PyBaseException` fields:
//! `args`, `cause`, `context`, `suppress_context`, `traceback`) and
//! `vm/stdlib/exceptions.rs`'s hierarchy table, trimmed to the taxonomy
//! spec.md §7 actually names.

use crate::class::PyClass;
use crate::value::{PyObject, PyObjectRef, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// The payload behind `Value::Exception`. Kept distinct from ordinary
/// `PyInstance` (rather than folded into it) because exceptions carry
/// fields — `args`/`cause`/`context`/`traceback` — that every exception
/// needs regardless of how deep a user subclass hierarchy goes, matching
/// the teacher's dedicated `PyBaseException` struct rather than modeling
/// them as plain instance-dict attributes.
pub struct PyExceptionObj {
    pub type_name: Rc<str>,
    pub args: Vec<PyObjectRef>,
    /// Set by `raise ... from cause` (spec.md §4.6).
    pub cause: Option<PyObjectRef>,
    /// Set automatically to whatever exception was being handled when this
    /// one was raised (spec.md §4.6 "implicit chaining").
    pub context: Option<PyObjectRef>,
    /// `raise ... from None` sets this so display code hides `context`.
    pub suppress_context: bool,
    /// Frame-describing strings appended as the exception unwinds each
    /// frame; display-only, not consulted by control flow.
    pub traceback: Vec<String>,
}

impl PyExceptionObj {
    pub fn message(&self) -> String {
        match self.args.first() {
            Some(obj) => match &obj.value {
                Value::Str(s) => s.to_string(),
                other => format!("{other:?}"),
            },
            None => String::new(),
        }
    }
}

/// The built-in exception classes, bootstrapped once per `VirtualMachine`
/// (spec.md design note: "no process-wide interpreter state").
pub struct ExceptionRegistry {
    pub base_exception: PyObjectRef,
    pub exception: PyObjectRef,
    pub stop_iteration: PyObjectRef,
    pub generator_exit: PyObjectRef,
    pub keyboard_interrupt: PyObjectRef,
    pub arithmetic_error: PyObjectRef,
    pub zero_division_error: PyObjectRef,
    pub overflow_error: PyObjectRef,
    pub assertion_error: PyObjectRef,
    pub attribute_error: PyObjectRef,
    pub lookup_error: PyObjectRef,
    pub index_error: PyObjectRef,
    pub key_error: PyObjectRef,
    pub name_error: PyObjectRef,
    pub unbound_local_error: PyObjectRef,
    pub runtime_error: PyObjectRef,
    pub not_implemented_error: PyObjectRef,
    pub recursion_error: PyObjectRef,
    pub type_error: PyObjectRef,
    pub value_error: PyObjectRef,
    pub import_error: PyObjectRef,
    pub module_not_found_error: PyObjectRef,
    pub os_error: PyObjectRef,
    pub cancelled_error: PyObjectRef,
}

fn make(name: &str, bases: Vec<PyObjectRef>, object_class: &PyObjectRef, type_class: &PyObjectRef) -> PyObjectRef {
    let mro = {
        // Flat linearization is enough here: every built-in exception base
        // chain is single-inheritance, so the C3 merge degenerates to a
        // simple concatenation. `class::linearize_mro` is still used for
        // any multi-base class a user later derives from one of these.
        let mut out = Vec::new();
        for b in &bases {
            out.push(b.clone());
            if let Value::Class(c) = &b.value {
                out.extend(c.mro.iter().cloned());
            }
        }
        out
    };
    let class = Rc::new(PyClass {
        name: Rc::from(name),
        bases: if bases.is_empty() { vec![object_class.clone()] } else { bases },
        mro,
        attrs: RefCell::new(crate::class::PyAttributes::new()),
        metaclass: RefCell::new(Some(type_class.clone())),
        is_exception: true,
        full_mro_cache: once_cell::unsync::OnceCell::new(),
    });
    PyObject::new(Value::Class(class), Some(type_class.clone()))
}

impl ExceptionRegistry {
    pub fn bootstrap(object_class: &PyObjectRef, type_class: &PyObjectRef) -> Self {
        let base_exception = make("BaseException", vec![object_class.clone()], object_class, type_class);
        let exception = make("Exception", vec![base_exception.clone()], object_class, type_class);
        let stop_iteration = make("StopIteration", vec![exception.clone()], object_class, type_class);
        let generator_exit = make("GeneratorExit", vec![base_exception.clone()], object_class, type_class);
        let keyboard_interrupt = make("KeyboardInterrupt", vec![base_exception.clone()], object_class, type_class);
        let arithmetic_error = make("ArithmeticError", vec![exception.clone()], object_class, type_class);
        let zero_division_error = make("ZeroDivisionError", vec![arithmetic_error.clone()], object_class, type_class);
        let overflow_error = make("OverflowError", vec![arithmetic_error.clone()], object_class, type_class);
        let assertion_error = make("AssertionError", vec![exception.clone()], object_class, type_class);
        let attribute_error = make("AttributeError", vec![exception.clone()], object_class, type_class);
        let lookup_error = make("LookupError", vec![exception.clone()], object_class, type_class);
        let index_error = make("IndexError", vec![lookup_error.clone()], object_class, type_class);
        let key_error = make("KeyError", vec![lookup_error.clone()], object_class, type_class);
        let name_error = make("NameError", vec![exception.clone()], object_class, type_class);
        let unbound_local_error = make("UnboundLocalError", vec![name_error.clone()], object_class, type_class);
        let runtime_error = make("RuntimeError", vec![exception.clone()], object_class, type_class);
        let not_implemented_error = make("NotImplementedError", vec![runtime_error.clone()], object_class, type_class);
        let recursion_error = make("RecursionError", vec![runtime_error.clone()], object_class, type_class);
        let type_error = make("TypeError", vec![exception.clone()], object_class, type_class);
        let value_error = make("ValueError", vec![exception.clone()], object_class, type_class);
        let import_error = make("ImportError", vec![exception.clone()], object_class, type_class);
        let module_not_found_error = make("ModuleNotFoundError", vec![import_error.clone()], object_class, type_class);
        let os_error = make("OSError", vec![exception.clone()], object_class, type_class);
        let cancelled_error = make("CancelledError", vec![base_exception.clone()], object_class, type_class);

        ExceptionRegistry {
            base_exception,
            exception,
            stop_iteration,
            generator_exit,
            keyboard_interrupt,
            arithmetic_error,
            zero_division_error,
            overflow_error,
            assertion_error,
            attribute_error,
            lookup_error,
            index_error,
            key_error,
            name_error,
            unbound_local_error,
            runtime_error,
            not_implemented_error,
            recursion_error,
            type_error,
            value_error,
            import_error,
            module_not_found_error,
            os_error,
            cancelled_error,
        }
    }
}

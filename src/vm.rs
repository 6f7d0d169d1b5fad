//! The virtual machine: frame stack, bootstrap context, and the embedder-
//! facing entry points (`run_code`, `call`, `send`, `throw`, `close`).
//!
//! Grounded on the teacher's `vm/vm.rs` (`VirtualMachine` owning a
//! `PyGlobalState`/`Context` plus a `Vec<FrameRef>` call stack) and
//! `vm/context.rs` (`Context` as the home of interned singletons). Threading
//! (`vm/thread.rs`, `PyThread`, per-thread recursion limits) is dropped: the
//! VM is single-threaded (spec.md design note), so there is exactly one
//! `VirtualMachine` per embedding, owned outright rather than behind `Arc`.

use crate::bytecode::CodeObject;
use crate::class::PyClass;
use crate::dict::PyDict;
use crate::exceptions::{ExceptionRegistry, PyExceptionObj};
use crate::frame::Frame;
use crate::generator::GeneratorTask;
use crate::value::{PyObject, PyObjectRef, Value};
use log::trace;
use num_bigint::BigInt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Every VM-level operation either produces a value or raises a Python
/// exception object; `VmInternalError`s (see `error.rs`) are converted to
/// a `PyBaseException`-ish exception object at the boundary so embedders
/// only ever have to handle one error channel, matching the teacher's
/// `PyResult<T> = Result<T, PyBaseExceptionRef>`.
pub type PyResult<T = PyObjectRef> = Result<T, PyObjectRef>;

/// Tunables the embedder can override; grounded on the teacher's
/// `vm/setting.rs::PySettings`.
#[derive(Debug, Clone)]
pub struct VmSettings {
    /// Re-check the cancellation flag every N executed opcodes.
    pub cancellation_poll_interval: u32,
    /// Refuse to materialize a `str`/`bytes` concatenation or repetition
    /// larger than this many bytes.
    pub sequence_byte_ceiling: usize,
    /// Refuse `list`/`tuple` repetition (`seq * n`) producing more than
    /// this many elements.
    pub sequence_repeat_item_ceiling: usize,
    /// Recursion limit on the Python-level frame stack.
    pub recursion_limit: usize,
}

impl Default for VmSettings {
    fn default() -> Self {
        VmSettings {
            cancellation_poll_interval: 2000,
            sequence_byte_ceiling: 100 * 1024 * 1024,
            sequence_repeat_item_ceiling: 10_000_000,
            recursion_limit: 1000,
        }
    }
}

/// Interned singletons and class registry, grounded on `vm/context.rs`'s
/// `Context`. Small-int interning lives here rather than process-wide
/// (spec.md design note (c)): identity stability of `-5..256` is a
/// per-`VirtualMachine` guarantee, not a global one.
pub struct Context {
    pub none: PyObjectRef,
    pub true_value: PyObjectRef,
    pub false_value: PyObjectRef,
    pub not_implemented: PyObjectRef,
    pub empty_tuple: PyObjectRef,
    pub object_class: PyObjectRef,
    pub type_class: PyObjectRef,
    pub exceptions: ExceptionRegistry,
    small_ints: Vec<PyObjectRef>,
}

const SMALL_INT_MIN: i64 = -5;
const SMALL_INT_MAX: i64 = 256;

impl Context {
    pub fn int(&self, value: BigInt) -> PyObjectRef {
        if let Some(small) = value_to_small_index(&value) {
            return self.small_ints[small].clone();
        }
        PyObject::new(Value::Int(value), Some(self.object_class.clone()))
    }

    pub fn bool(&self, value: bool) -> PyObjectRef {
        if value {
            self.true_value.clone()
        } else {
            self.false_value.clone()
        }
    }
}

fn value_to_small_index(value: &BigInt) -> Option<usize> {
    let as_i64: i64 = value.try_into().ok()?;
    if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&as_i64) {
        Some((as_i64 - SMALL_INT_MIN) as usize)
    } else {
        None
    }
}

/// A single still-suspended generator/coroutine awaiting its next `send`,
/// used only for the embedder API's sake; the bulk of the state lives in
/// `GeneratorTask` itself.
pub struct VirtualMachine {
    pub ctx: Context,
    pub settings: VmSettings,
    /// The live call stack of Python-level frames (innermost last). Kept
    /// behind a `RefCell` (rather than requiring `&mut VirtualMachine`
    /// everywhere) because dict/set key hashing and equality may need to
    /// call back into user `__hash__`/`__eq__` methods, and those call
    /// sites only ever hold a shared `&VirtualMachine`.
    pub frames: RefCell<Vec<Rc<RefCell<Frame>>>>,
    /// The exception currently being handled by a `try/except` block, if
    /// any — consulted for bare `raise` and for `__context__` chaining
    /// (spec.md §4.6).
    pub current_exception: RefCell<Option<PyObjectRef>>,
    /// The embedder-supplied builtins namespace (spec.md §1: the
    /// surrounding builtins/import ecosystem is an external collaborator),
    /// consulted by `LOAD_GLOBAL`/`LOAD_NAME` as the final fallback after a
    /// module's own globals.
    pub builtins: RefCell<PyDict>,
    cancelled: Cell<bool>,
}

impl VirtualMachine {
    pub fn new() -> Self {
        let object_class = bootstrap_object_class();
        let type_class = bootstrap_type_class(&object_class);
        let exceptions = ExceptionRegistry::bootstrap(&object_class, &type_class);
        let none = PyObject::new(Value::None, Some(object_class.clone()));
        let true_value = PyObject::new(Value::Bool(true), Some(object_class.clone()));
        let false_value = PyObject::new(Value::Bool(false), Some(object_class.clone()));
        let not_implemented = PyObject::new(Value::NotImplemented, Some(object_class.clone()));
        let empty_tuple = PyObject::new(Value::Tuple(Rc::from(Vec::new())), Some(object_class.clone()));

        let small_ints = (SMALL_INT_MIN..=SMALL_INT_MAX)
            .map(|i| PyObject::new(Value::Int(BigInt::from(i)), Some(object_class.clone())))
            .collect();

        let ctx = Context {
            none,
            true_value,
            false_value,
            not_implemented,
            empty_tuple,
            object_class,
            type_class,
            exceptions,
            small_ints,
        };

        VirtualMachine {
            ctx,
            settings: VmSettings::default(),
            frames: RefCell::new(Vec::new()),
            current_exception: RefCell::new(None),
            builtins: RefCell::new(PyDict::new()),
            cancelled: Cell::new(false),
        }
    }

    /// Replace the builtins namespace consulted as the final fallback for
    /// unresolved global names (e.g. `builtins_core::bootstrap` populates
    /// this with `print`/`len`/the exception classes/etc.).
    pub fn set_builtins(&self, dict: PyDict) {
        *self.builtins.borrow_mut() = dict;
    }

    pub fn with_settings(settings: VmSettings) -> Self {
        let mut vm = Self::new();
        vm.settings = settings;
        vm
    }

    /// Cooperative cancellation: set from another thread/signal handler in
    /// the embedder; the frame loop polls this every
    /// `settings.cancellation_poll_interval` opcodes (spec.md §5).
    pub fn request_cancellation(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn clear_cancellation(&self) {
        self.cancelled.set(false);
    }

    /// Run a top-level module/script code object to completion.
    pub fn run_code(&self, code: Rc<CodeObject>, globals: PyObjectRef) -> PyResult<PyObjectRef> {
        trace!("run_code: {}", code.name);
        self.catch_internal_errors(std::panic::AssertUnwindSafe(|| {
            let frame = Frame::new_module_frame(self, code, globals);
            crate::frame::run_frame(self, frame)
        }))
    }

    /// Call any callable value with positional/keyword arguments, per the
    /// call protocol (spec.md §4.1/§4.4).
    pub fn call(
        &self,
        callable: &PyObjectRef,
        args: Vec<PyObjectRef>,
        kwargs: PyDict,
    ) -> PyResult<PyObjectRef> {
        self.catch_internal_errors(std::panic::AssertUnwindSafe(|| {
            crate::protocol::call::call_object(self, callable, args, kwargs)
        }))
    }

    pub fn send(&self, gen: &Rc<GeneratorTask>, value: PyObjectRef) -> PyResult<PyObjectRef> {
        self.catch_internal_errors(std::panic::AssertUnwindSafe(|| crate::generator::send(self, gen, value)))
    }

    pub fn throw(
        &self,
        gen: &Rc<GeneratorTask>,
        exc: PyObjectRef,
    ) -> PyResult<PyObjectRef> {
        self.catch_internal_errors(std::panic::AssertUnwindSafe(|| crate::generator::throw(self, gen, exc)))
    }

    pub fn close(&self, gen: &Rc<GeneratorTask>) -> PyResult<()> {
        self.catch_internal_errors(std::panic::AssertUnwindSafe(|| crate::generator::close(self, gen)))
    }

    /// Catch a panic carrying a typed `VmInternalError` (raised only at
    /// compiler-trusted-invariant sites in `frame.rs`, never from
    /// user-reachable code paths) and surface it as an ordinary
    /// `RuntimeError` instead of unwinding into the embedder. Any frames
    /// left on the stack by the aborted call are dropped, since the
    /// unwind skipped their normal pop.
    fn catch_internal_errors<T>(&self, f: impl FnOnce() -> PyResult<T> + std::panic::UnwindSafe) -> PyResult<T> {
        let depth_before = self.frames.borrow().len();
        match std::panic::catch_unwind(f) {
            Ok(result) => result,
            Err(payload) => {
                self.frames.borrow_mut().truncate(depth_before);
                let detail = payload
                    .downcast::<crate::error::VmInternalError>()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|_| "internal VM invariant violation".to_owned());
                Err(self.new_runtime_error(format!("internal interpreter error: {detail}")))
            }
        }
    }

    pub fn class_of(&self, obj: &PyObjectRef) -> PyObjectRef {
        obj.class
            .borrow()
            .clone()
            .unwrap_or_else(|| self.ctx.object_class.clone())
    }

    pub fn is_instance(&self, obj: &PyObjectRef, class: &PyObjectRef) -> bool {
        PyClass::is_subclass_of(&self.class_of(obj), class)
    }

    // --- exception constructors -------------------------------------------------

    pub fn new_exception(&self, class: &PyObjectRef, message: String) -> PyObjectRef {
        let args = vec![PyObject::new(
            Value::Str(Rc::from(message.as_str())),
            Some(self.ctx.object_class.clone()),
        )];
        let exc = PyExceptionObj {
            type_name: class_name(class),
            args,
            context: None,
            cause: None,
            suppress_context: false,
            traceback: Vec::new(),
        };
        PyObject::new(Value::Exception(RefCell::new(exc)), Some(class.clone()))
    }

    pub fn new_type_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.type_error, message)
    }

    pub fn new_value_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.value_error, message)
    }

    pub fn new_key_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.key_error, message)
    }

    pub fn new_index_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.index_error, message)
    }

    pub fn new_attribute_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.attribute_error, message)
    }

    pub fn new_name_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.name_error, message)
    }

    pub fn new_zero_division_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.zero_division_error, message)
    }

    pub fn new_stop_iteration(&self, value: Option<PyObjectRef>) -> PyObjectRef {
        let exc = self.new_exception(
            &self.ctx.exceptions.stop_iteration,
            String::new(),
        );
        if let (Value::Exception(cell), Some(v)) = (&exc.value, value) {
            cell.borrow_mut().args = vec![v];
        }
        exc
    }

    pub fn new_recursion_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.recursion_error, message)
    }

    pub fn new_runtime_error(&self, message: String) -> PyObjectRef {
        self.new_exception(&self.ctx.exceptions.runtime_error, message)
    }
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn class_name(class: &PyObjectRef) -> Rc<str> {
    match &class.value {
        Value::Class(c) => c.name.clone(),
        _ => Rc::from("object"),
    }
}

/// Bootstrap `object`: the only class whose own class pointer is itself
/// (tied off after construction, mirroring the teacher's bootstrap of
/// `PyBaseObject`/`PyType` in `vm/builtins/type.rs::init_type_hierarchy`).
fn bootstrap_object_class() -> PyObjectRef {
    let class = Rc::new(PyClass {
        name: Rc::from("object"),
        bases: Vec::new(),
        mro: Vec::new(),
        attrs: RefCell::new(crate::class::PyAttributes::new()),
        metaclass: RefCell::new(None),
        is_exception: false,
        full_mro_cache: once_cell::unsync::OnceCell::new(),
    });
    PyObject::new(Value::Class(class), None)
}

fn bootstrap_type_class(object_class: &PyObjectRef) -> PyObjectRef {
    let class = Rc::new(PyClass {
        name: Rc::from("type"),
        bases: vec![object_class.clone()],
        mro: vec![object_class.clone()],
        attrs: RefCell::new(crate::class::PyAttributes::new()),
        metaclass: RefCell::new(None),
        is_exception: false,
        full_mro_cache: once_cell::unsync::OnceCell::new(),
    });
    PyObject::new(Value::Class(class), Some(object_class.clone()))
}

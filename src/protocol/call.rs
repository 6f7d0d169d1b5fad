//! The call protocol: invoking functions, bound methods, builtins, and
//! classes (construction).
//!
//! Grounded on the teacher's `function.rs::fill_locals_from_args` for
//! argument binding (positional, `*args`, keyword, `**kwargs`, defaults)
//! and `vm/vm.rs::invoke`/`PyObject::call` for the callable dispatch
//! table. The descriptor protocol is intentionally the simplified form
//! spec.md's design note calls for: a plain function found via attribute
//! lookup on an instance becomes a `PyBoundMethod`, full-blown
//! `__get__`/`__set__` descriptors are not modeled.

use crate::class::{self as classmod, PyClass};
use crate::dict::PyDict;
use crate::function::{FuncArgs, PyBoundMethod, PyCell, PyFunction};
use crate::value::{PyObject, PyObjectRef, Value};
use crate::vm::{PyResult, VirtualMachine};
use itertools::Itertools;
use std::cell::RefCell;
use std::rc::Rc;

/// Call `callable(*args, **kwargs)`.
pub fn call_object(
    vm: &VirtualMachine,
    callable: &PyObjectRef,
    args: Vec<PyObjectRef>,
    kwargs: PyDict,
) -> PyResult<PyObjectRef> {
    match &callable.value {
        Value::Function(function) => call_function(vm, function, args, kwargs),
        Value::BoundMethod(bound) => {
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(bound.receiver.clone());
            full_args.extend(args);
            call_object(vm, &bound.function, full_args, kwargs)
        }
        Value::BuiltinFunction(builtin) => {
            let func_args = FuncArgs {
                args,
                kwargs: dict_to_pairs(&kwargs),
            };
            (builtin.func)(vm, func_args)
        }
        Value::Class(_) => construct_instance(vm, callable, args, kwargs),
        _ => {
            let getattr_result = crate::protocol::attr::getattr(vm, callable, "__call__");
            if let Ok(dunder) = getattr_result {
                return call_object(vm, &dunder, args, kwargs);
            }
            Err(vm.new_type_error(format!("{:?} is not callable", callable.value)))
        }
    }
}

/// Call with positional args only, no keywords — convenience used by the
/// equality/operator protocols to invoke dunder methods.
pub fn call_object_const(vm: &VirtualMachine, callable: &PyObjectRef, args: Vec<PyObjectRef>) -> PyResult<PyObjectRef> {
    call_object(vm, callable, args, PyDict::new())
}

fn dict_to_pairs(dict: &PyDict) -> Vec<(Rc<str>, PyObjectRef)> {
    dict.iter()
        .filter_map(|(k, v)| match &k.value {
            Value::Str(s) => Some((s.clone(), v)),
            _ => None,
        })
        .collect()
}

fn call_function(
    vm: &VirtualMachine,
    function: &Rc<PyFunction>,
    args: Vec<PyObjectRef>,
    kwargs: PyDict,
) -> PyResult<PyObjectRef> {
    let bound_locals = bind_arguments(vm, function, args, kwargs)?;

    if function.code.flags.contains(crate::bytecode::CodeFlags::IS_GENERATOR)
        || function.code.flags.contains(crate::bytecode::CodeFlags::IS_COROUTINE)
    {
        let frame = crate::frame::Frame::new_call_frame(function, bound_locals);
        let is_coroutine = function.code.flags.contains(crate::bytecode::CodeFlags::IS_COROUTINE);
        let task = crate::generator::GeneratorTask::new(frame, function.name.clone(), is_coroutine);
        let value = if is_coroutine {
            Value::Coroutine(Rc::new(task))
        } else {
            Value::Generator(Rc::new(task))
        };
        return Ok(PyObject::new(value, Some(vm.ctx.object_class.clone())));
    }

    let frame = crate::frame::Frame::new_call_frame(function, bound_locals);
    crate::frame::run_frame(vm, frame)
}

/// `fill_locals_from_args` (teacher naming kept): bind positional, `*args`,
/// keyword, and `**kwargs` arguments into the function's fast-locals slots
/// in `CodeObject.varnames` order, applying defaults for anything left
/// unbound. Spec.md §4.1 "Argument binding".
pub fn bind_arguments(
    vm: &VirtualMachine,
    function: &PyFunction,
    mut args: Vec<PyObjectRef>,
    mut kwargs: PyDict,
) -> PyResult<Vec<Option<PyObjectRef>>> {
    let code = &function.code;
    let mut locals: Vec<Option<PyObjectRef>> = vec![None; code.varnames.len()];

    let n_positional_params = code.arg_count as usize;
    let has_varargs = code.varargs_slot().is_some();
    let has_varkwargs = code.varkeywords_slot().is_some();

    if args.len() > n_positional_params && !has_varargs {
        return Err(vm.new_type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            function.name,
            n_positional_params,
            args.len()
        )));
    }

    let extra_positional: Vec<PyObjectRef> = if args.len() > n_positional_params {
        args.split_off(n_positional_params)
    } else {
        Vec::new()
    };

    for (i, value) in args.into_iter().enumerate() {
        locals[i] = Some(value);
    }

    // Keyword arguments: match against positional-or-keyword and
    // keyword-only names; anything unmatched goes to **kwargs if present.
    let kwonly_start = n_positional_params;
    let kwonly_end = kwonly_start + code.kwonlyarg_count as usize;
    let mut leftover_kwargs = PyDict::new();
    for (key, value) in kwargs.iter() {
        let Value::Str(name) = &key.value else { continue };
        let slot = code.varnames[..kwonly_end]
            .iter()
            .position(|n| n.as_ref() == name.as_ref());
        match slot {
            Some(idx) if idx < n_positional_params => {
                if locals[idx].is_some() {
                    return Err(vm.new_type_error(format!(
                        "{}() got multiple values for argument '{name}'",
                        function.name
                    )));
                }
                locals[idx] = Some(value);
            }
            Some(idx) => locals[idx] = Some(value),
            None => {
                if has_varkwargs {
                    leftover_kwargs.insert(vm, key.clone(), value)?;
                } else {
                    return Err(vm.new_type_error(format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        function.name
                    )));
                }
            }
        }
    }
    let _ = &mut kwargs;

    // Defaults for trailing positional-or-keyword params.
    let n_defaults = function.defaults.len();
    for (i, default) in function.defaults.iter().enumerate() {
        let idx = n_positional_params - n_defaults + i;
        if locals[idx].is_none() {
            locals[idx] = Some(default.clone());
        }
    }
    for (name, default) in &function.kwonly_defaults {
        if let Some(idx) = code.varnames[kwonly_start..kwonly_end]
            .iter()
            .position(|n| n == name)
            .map(|i| i + kwonly_start)
        {
            if locals[idx].is_none() {
                locals[idx] = Some(default.clone());
            }
        }
    }

    if let Some(slot) = code.varargs_slot() {
        locals[slot as usize] = Some(PyObject::new(
            Value::Tuple(Rc::from(extra_positional)),
            Some(vm.ctx.object_class.clone()),
        ));
    } else if !extra_positional.is_empty() {
        return Err(vm.new_type_error(format!("{}() takes too many positional arguments", function.name)));
    }

    if let Some(slot) = code.varkeywords_slot() {
        locals[slot as usize] = Some(PyObject::new(
            Value::Dict(RefCell::new(leftover_kwargs)),
            Some(vm.ctx.object_class.clone()),
        ));
    }

    let missing: Vec<&Rc<str>> = (0..kwonly_end.min(locals.len()))
        .filter(|&idx| locals[idx].is_none())
        .map(|idx| &code.varnames[idx])
        .collect();
    if !missing.is_empty() {
        return Err(vm.new_type_error(format!(
            "{}() missing {} required argument{}: {}",
            function.name,
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            missing.iter().map(|n| format!("'{n}'")).format(", "),
        )));
    }

    Ok(locals)
}

/// `__build_class__`/construction: allocate a fresh instance, call
/// `__init__`, return the instance (spec.md §4.4).
fn construct_instance(
    vm: &VirtualMachine,
    class_obj: &PyObjectRef,
    args: Vec<PyObjectRef>,
    kwargs: PyDict,
) -> PyResult<PyObjectRef> {
    let Some(class) = classmod::as_class(class_obj) else {
        return Err(vm.new_type_error("not a class".to_owned()));
    };

    // A metaclass that overrides `__call__` (beyond the base `type`'s
    // implicit construction protocol) takes over entirely (spec.md §4.1).
    let metaclass = vm.class_of(class_obj);
    if let Some(call_method) = classmod::find_dunder(&metaclass, "__call__") {
        return call_object(vm, &call_method, prepend(class_obj.clone(), args), kwargs);
    }

    if let Some(abstract_methods) = class.attrs.borrow().get("__abstractmethods__").cloned() {
        if crate::protocol::operator::len(vm, &abstract_methods)? > 0 {
            return Err(vm.new_type_error(format!(
                "Can't instantiate abstract class {} with abstract methods",
                class.name
            )));
        }
    }

    if class.is_exception {
        let exc = crate::exceptions::PyExceptionObj {
            type_name: class.name.clone(),
            args: args.clone(),
            context: None,
            cause: None,
            suppress_context: false,
            traceback: Vec::new(),
        };
        let obj = PyObject::new(Value::Exception(RefCell::new(exc)), Some(class_obj.clone()));
        if let Some(init) = classmod::find_dunder(class_obj, "__init__") {
            call_object(vm, &init, prepend(obj.clone(), args), kwargs)?;
        }
        return Ok(obj);
    }

    let instance = crate::class::PyInstance {
        class: class.clone(),
        dict: Rc::new(RefCell::new(PyDict::new())),
    };
    let obj = PyObject::new(Value::Instance(instance), Some(class_obj.clone()));

    if let Some(new_method) = classmod::find_dunder(class_obj, "__new__") {
        let created = call_object(vm, &new_method, prepend(class_obj.clone(), args.clone()), kwargs.clone_shallow())?;
        // Only search for `__init__` when `__new__` actually returned an
        // instance of this class (spec.md §4.1); a `__new__` that returns
        // something unrelated (a sentinel, a different type) skips `__init__`
        // entirely.
        let created_class = vm.class_of(&created);
        if PyClass::is_subclass_of(&created_class, class_obj) {
            if let Some(init) = classmod::find_dunder(&created_class, "__init__") {
                call_object(vm, &init, prepend(created.clone(), args), kwargs)?;
            }
        }
        return Ok(created);
    }

    if let Some(init) = classmod::find_dunder(class_obj, "__init__") {
        call_object(vm, &init, prepend(obj.clone(), args), kwargs)?;
    }
    Ok(obj)
}

fn prepend(first: PyObjectRef, rest: Vec<PyObjectRef>) -> Vec<PyObjectRef> {
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(first);
    out.extend(rest);
    out
}

/// Bind a plain function found via attribute lookup on an instance into a
/// `PyBoundMethod` — the simplified descriptor protocol spec.md's design
/// note calls for (staticmethod/classmethod are the only two descriptor
/// behaviors modeled explicitly, in `attr.rs`).
pub fn bind_method(receiver: PyObjectRef, function: PyObjectRef) -> PyBoundMethod {
    PyBoundMethod { receiver, function }
}

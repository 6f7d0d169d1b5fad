//! Attribute access: `getattr`/`setattr`/`delattr`, MRO-ordered lookup,
//! and the simplified descriptor protocol spec.md's design note calls
//! for (plain functions become bound methods; `staticmethod`/`classmethod`
//! wrappers are recognized specially; no general `__get__`/`__set__`).
//!
//! Grounded on the teacher's `vm/vm.rs::get_attribute`/`PyObject::getattr`
//! MRO walk, simplified by dropping `vm/object/descriptor.rs`'s full
//! generic descriptor machinery (data vs. non-data descriptors, slot
//! wrappers) since spec.md only asks for the method-binding case.

use crate::class::find_dunder;
use crate::dict::PyDict;
use crate::function::PyBoundMethod;
use crate::protocol::call::call_object;
use crate::value::{PyObjectRef, Value};
use crate::vm::{PyResult, VirtualMachine};
use std::rc::Rc;

/// `obj.name`.
pub fn getattr(vm: &VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult<PyObjectRef> {
    // Instance dict wins over class attributes (spec.md §4.1 "Attribute
    // resolution order": instance dict, then class MRO).
    if let Value::Instance(instance) = &obj.value {
        if let Some(v) = instance.dict.borrow().get_plain(name)? {
            return Ok(v);
        }
    }
    if let Value::Module(m) = &obj.value {
        if let Some(v) = m.dict.borrow().get_plain(name)? {
            return Ok(v);
        }
        return Err(vm.new_attribute_error(format!("module has no attribute '{name}'")));
    }
    if let Value::Exception(exc) = &obj.value {
        match name {
            "args" => {
                let e = exc.borrow();
                return Ok(crate::value::PyObject::new(
                    Value::Tuple(Rc::from(e.args.clone())),
                    Some(vm.ctx.object_class.clone()),
                ));
            }
            "__cause__" => return Ok(exc.borrow().cause.clone().unwrap_or_else(|| vm.ctx.none.clone())),
            "__context__" => return Ok(exc.borrow().context.clone().unwrap_or_else(|| vm.ctx.none.clone())),
            _ => {}
        }
    }

    let class_obj = vm.class_of(obj);
    if let Value::Class(_) = &obj.value {
        // Attribute lookup on a class itself: search its own MRO directly
        // (no instance-dict step), e.g. `MyClass.method`.
        if let Some(found) = find_dunder(obj, name) {
            return Ok(unwrap_descriptor(found, None, obj));
        }
    }
    if let Some(found) = find_dunder(&class_obj, name) {
        return Ok(unwrap_descriptor(found, Some(obj.clone()), &class_obj));
    }

    Err(vm.new_attribute_error(format!("'{}' object has no attribute '{name}'", class_name(&class_obj))))
}

fn class_name(class_obj: &PyObjectRef) -> Rc<str> {
    match &class_obj.value {
        Value::Class(c) => c.name.clone(),
        _ => Rc::from("object"),
    }
}

/// `staticmethod`/`classmethod` are the two descriptor behaviors modeled
/// explicitly (spec.md §4.1 design note), each its own `Value` variant
/// rather than routing through a generic `__get__`: `staticmethod(f)`
/// always yields `f` unbound, `classmethod(f)` always binds to
/// `class_obj` (never the instance), and a plain function binds to
/// `receiver` if one was supplied (instance access, not class access).
fn unwrap_descriptor(found: PyObjectRef, receiver: Option<PyObjectRef>, class_obj: &PyObjectRef) -> PyObjectRef {
    match (&found.value, receiver) {
        (Value::StaticMethod(callable), _) => callable.clone(),
        (Value::ClassMethod(callable), _) => crate::value::PyObject::new(
            Value::BoundMethod(Rc::new(PyBoundMethod { receiver: class_obj.clone(), function: callable.clone() })),
            callable.class.borrow().clone(),
        ),
        (Value::Function(_), Some(receiver)) => crate::value::PyObject::new(
            Value::BoundMethod(Rc::new(PyBoundMethod { receiver, function: found.clone() })),
            found.class.borrow().clone(),
        ),
        _ => found,
    }
}

/// `obj.name = value`.
pub fn setattr(vm: &VirtualMachine, obj: &PyObjectRef, name: &str, value: PyObjectRef) -> PyResult<()> {
    if let Value::Instance(_) = &obj.value {
        let class_obj = vm.class_of(obj);
        if let Some(setattr_method) = find_dunder(&class_obj, "__setattr__") {
            let key = crate::value::PyObject::new(Value::Str(Rc::from(name)), Some(vm.ctx.object_class.clone()));
            call_object(vm, &setattr_method, vec![obj.clone(), key, value], PyDict::new())?;
            return Ok(());
        }
    }
    match &obj.value {
        Value::Instance(instance) => {
            let key = crate::value::PyObject::new(Value::Str(Rc::from(name)), Some(vm.ctx.object_class.clone()));
            instance.dict.borrow_mut().insert(vm, key, value)?;
            Ok(())
        }
        Value::Module(m) => {
            let key = crate::value::PyObject::new(Value::Str(Rc::from(name)), Some(vm.ctx.object_class.clone()));
            m.dict.borrow_mut().insert(vm, key, value)?;
            Ok(())
        }
        Value::Class(c) => {
            c.attrs.borrow_mut().insert(Rc::from(name), value);
            Ok(())
        }
        _ => Err(vm.new_attribute_error(format!("'{}' object has no attribute '{name}'", class_name(&vm.class_of(obj))))),
    }
}

/// `del obj.name`.
pub fn delattr(vm: &VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult<()> {
    if let Value::Instance(_) = &obj.value {
        let class_obj = vm.class_of(obj);
        if let Some(delattr_method) = find_dunder(&class_obj, "__delattr__") {
            let key = crate::value::PyObject::new(Value::Str(Rc::from(name)), Some(vm.ctx.object_class.clone()));
            call_object(vm, &delattr_method, vec![obj.clone(), key], PyDict::new())?;
            return Ok(());
        }
    }
    match &obj.value {
        Value::Instance(instance) => {
            let key = crate::value::PyObject::new(Value::Str(Rc::from(name)), Some(vm.ctx.object_class.clone()));
            if instance.dict.borrow_mut().remove(vm, &key)?.is_none() {
                return Err(vm.new_attribute_error(format!("no attribute '{name}'")));
            }
            Ok(())
        }
        _ => Err(vm.new_attribute_error(format!("'{}' object has no attribute '{name}'", class_name(&vm.class_of(obj))))),
    }
}

/// Resolve `class` attribute/method membership for `isinstance`-adjacent
/// checks used by the class-body builder.
pub fn class_has_own(class_obj: &PyObjectRef, name: &str) -> bool {
    if let Value::Class(c) = &class_obj.value {
        c.attrs.borrow().contains_key(name)
    } else {
        false
    }
}

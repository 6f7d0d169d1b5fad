//! `==`/`!=` and `hash()`, including cycle-safe container comparison.
//!
//! Grounded on the teacher's `vm/vm.rs::_eq`/`PyObject::rich_compare` for
//! the dunder-dispatch shape, and `vm/builtins/dict.rs`'s reliance on a
//! raw integer hash for the same reasons `crate::dict` needs one. Cycle
//! safety (spec.md §8's `L = [L]; L == L` example) is grounded directly in
//! spec.md §9 design note — no teacher snapshot implements it, since the
//! teacher leans on Rust-level recursion plus a process limit instead.

use crate::class::find_dunder;
use crate::dict::{PyDict, PySet};
use crate::value::{PyObjectRef, Value};
use crate::vm::{PyResult, VirtualMachine};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// `a == b`, Python semantics: always succeeds (no `TypeError` for
/// mismatched types — they simply compare unequal), cycle-safe for
/// self-referential containers.
pub fn value_eq(vm: &VirtualMachine, a: &PyObjectRef, b: &PyObjectRef) -> PyResult<bool> {
    let mut seen = Vec::new();
    eq_inner(vm, a, b, &mut seen)
}

fn pair_key(a: &PyObjectRef, b: &PyObjectRef) -> (usize, usize) {
    (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize)
}

fn eq_inner(
    vm: &VirtualMachine,
    a: &PyObjectRef,
    b: &PyObjectRef,
    seen: &mut Vec<(usize, usize)>,
) -> PyResult<bool> {
    if crate::value::is_identical(a, b) {
        return Ok(true);
    }
    let key = pair_key(a, b);
    if seen.contains(&key) {
        // Re-entering the same pair while still comparing it: the
        // containers are mutually self-referential at this position,
        // which Python treats as equal (matches CPython's `Py_EnterRecursiveCall`
        // cycle guard for `list`/`tuple`/`dict` comparisons).
        return Ok(true);
    }

    match (&a.value, &b.value) {
        (Value::None, Value::None) => Ok(true),
        (Value::NotImplemented, Value::NotImplemented) => Ok(true),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::Bool(x), Value::Int(y)) | (Value::Int(y), Value::Bool(x)) => {
            Ok(&num_bigint::BigInt::from(*x as i64) == y)
        }
        (Value::Int(x), Value::Int(y)) => Ok(x == y),
        (Value::Float(x), Value::Float(y)) => Ok(x == y),
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
            Ok(bigint_to_f64(x) == *y)
        }
        (Value::Complex(x), Value::Complex(y)) => Ok(x == y),
        (Value::Complex(x), Value::Float(y)) | (Value::Float(y), Value::Complex(x)) => {
            Ok(x.im == 0.0 && x.re == *y)
        }
        (Value::Complex(x), Value::Int(y)) | (Value::Int(y), Value::Complex(x)) => {
            Ok(x.im == 0.0 && x.re == bigint_to_f64(y))
        }
        (Value::Str(x), Value::Str(y)) => Ok(x == y),
        (Value::Bytes(x), Value::Bytes(y)) => Ok(x == y),
        (Value::Tuple(x), Value::Tuple(y)) => {
            if x.len() != y.len() {
                return Ok(false);
            }
            seen.push(key);
            for (xi, yi) in x.iter().zip(y.iter()) {
                if !eq_inner(vm, xi, yi, seen)? {
                    seen.pop();
                    return Ok(false);
                }
            }
            seen.pop();
            Ok(true)
        }
        (Value::List(x), Value::List(y)) => {
            let xb = x.borrow();
            let yb = y.borrow();
            if xb.len() != yb.len() {
                return Ok(false);
            }
            seen.push(key);
            for (xi, yi) in xb.iter().zip(yb.iter()) {
                if !eq_inner(vm, xi, yi, seen)? {
                    seen.pop();
                    return Ok(false);
                }
            }
            seen.pop();
            Ok(true)
        }
        (Value::Dict(x), Value::Dict(y)) => {
            let xb = x.borrow();
            let yb = y.borrow();
            if xb.len() != yb.len() {
                return Ok(false);
            }
            seen.push(key);
            let result = dict_eq(vm, &xb, &yb, seen);
            seen.pop();
            result
        }
        (Value::Set(x), Value::Set(y)) => set_eq(vm, &x.borrow(), &y.borrow()),
        (Value::FrozenSet(x), Value::FrozenSet(y)) => set_eq(vm, x, y),
        (Value::Set(x), Value::FrozenSet(y)) | (Value::FrozenSet(y), Value::Set(x)) => {
            set_eq(vm, &x.borrow(), y)
        }
        (Value::Range(x), Value::Range(y)) => {
            if x.is_empty() && y.is_empty() {
                return Ok(true);
            }
            Ok(x == y)
        }
        (Value::Class(_), Value::Class(_))
        | (Value::Function(_), Value::Function(_))
        | (Value::Module(_), Value::Module(_)) => Ok(crate::value::is_identical(a, b)),
        (Value::Instance(_), _) | (_, Value::Instance(_)) => instance_eq(vm, a, b),
        (Value::Exception(_), Value::Exception(_)) => Ok(crate::value::is_identical(a, b)),
        _ => Ok(false),
    }
}

fn dict_eq(vm: &VirtualMachine, x: &PyDict, y: &PyDict, seen: &mut Vec<(usize, usize)>) -> PyResult<bool> {
    for (k, v) in x.iter() {
        match y.get(vm, &k)? {
            Some(yv) => {
                if !eq_inner(vm, &v, &yv, seen)? {
                    return Ok(false);
                }
            }
            None => return Ok(false),
        }
    }
    Ok(true)
}

fn set_eq(vm: &VirtualMachine, x: &PySet, y: &PySet) -> PyResult<bool> {
    if x.len() != y.len() {
        return Ok(false);
    }
    for item in x.iter() {
        if !y.contains(vm, &item)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Rich-comparison dunder dispatch for instances: try `a.__eq__(b)`, and
/// if it returns `NotImplemented` (or doesn't exist), try
/// `b.__eq__(a)`, and if that also doesn't resolve, default to identity
/// (spec.md §4.1 "operator protocol").
fn instance_eq(vm: &VirtualMachine, a: &PyObjectRef, b: &PyObjectRef) -> PyResult<bool> {
    let a_class = vm.class_of(a);
    if let Some(method) = find_dunder(&a_class, "__eq__") {
        let result = crate::protocol::call::call_object_const(vm, &method, vec![a.clone(), b.clone()])?;
        if !matches!(result.value, Value::NotImplemented) {
            return operator_truthy_result(vm, &result);
        }
    }
    let b_class = vm.class_of(b);
    if let Some(method) = find_dunder(&b_class, "__eq__") {
        let result = crate::protocol::call::call_object_const(vm, &method, vec![b.clone(), a.clone()])?;
        if !matches!(result.value, Value::NotImplemented) {
            return operator_truthy_result(vm, &result);
        }
    }
    Ok(crate::value::is_identical(a, b))
}

fn operator_truthy_result(vm: &VirtualMachine, v: &PyObjectRef) -> PyResult<bool> {
    crate::protocol::operator::truthy(vm, v)
}

fn bigint_to_f64(i: &num_bigint::BigInt) -> f64 {
    use num_traits::ToPrimitive;
    i.to_f64().unwrap_or(f64::NAN)
}

/// `hash(obj)`. Mutable containers (`list`/`dict`/`set`) are unhashable
/// (spec.md §3); everything else follows CPython's "equal values hash
/// equal" invariant across the numeric tower.
pub fn value_hash(vm: &VirtualMachine, obj: &PyObjectRef) -> PyResult<i64> {
    match &obj.value {
        Value::None => Ok(0),
        Value::NotImplemented => Ok(1),
        Value::Bool(b) => Ok(*b as i64),
        Value::Int(i) => Ok(hash_bigint(i)),
        Value::Float(f) => Ok(hash_f64(*f)),
        Value::Complex(c) => {
            if c.im == 0.0 {
                Ok(hash_f64(c.re))
            } else {
                let mut hasher = DefaultHasher::new();
                c.re.to_bits().hash(&mut hasher);
                c.im.to_bits().hash(&mut hasher);
                Ok(hasher.finish() as i64)
            }
        }
        Value::Str(s) => Ok(hash_bytes(s.as_bytes())),
        Value::Bytes(b) => Ok(hash_bytes(b)),
        Value::Tuple(items) => {
            let mut hasher = DefaultHasher::new();
            for item in items.iter() {
                value_hash(vm, item)?.hash(&mut hasher);
            }
            Ok(hasher.finish() as i64)
        }
        Value::FrozenSet(set) => {
            let mut acc: i64 = 0;
            for item in set.iter() {
                acc ^= value_hash(vm, &item)?;
            }
            Ok(acc)
        }
        Value::Range(r) => {
            let mut hasher = DefaultHasher::new();
            r.start.to_string().hash(&mut hasher);
            r.stop.to_string().hash(&mut hasher);
            r.step.to_string().hash(&mut hasher);
            Ok(hasher.finish() as i64)
        }
        Value::List(_) | Value::Dict(_) | Value::Set(_) => {
            Err(vm.new_type_error("unhashable type".to_owned()))
        }
        Value::Instance(_) => {
            let class = vm.class_of(obj);
            if let Some(method) = find_dunder(&class, "__hash__") {
                let result = crate::protocol::call::call_object_const(vm, &method, vec![obj.clone()])?;
                return match &result.value {
                    Value::Int(i) => Ok(hash_bigint(i)),
                    _ => Err(vm.new_type_error("__hash__ must return an int".to_owned())),
                };
            }
            Ok(Rc::as_ptr(obj) as i64)
        }
        _ => Ok(Rc::as_ptr(obj) as i64),
    }
}

fn hash_bigint(i: &num_bigint::BigInt) -> i64 {
    use num_traits::ToPrimitive;
    match i.to_i64() {
        Some(v) => v,
        None => {
            let mut hasher = DefaultHasher::new();
            i.to_string().hash(&mut hasher);
            hasher.finish() as i64
        }
    }
}

fn hash_f64(f: f64) -> i64 {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 {
        f as i64
    } else {
        f.to_bits() as i64
    }
}

fn hash_bytes(b: &[u8]) -> i64 {
    let mut hasher = DefaultHasher::new();
    b.hash(&mut hasher);
    hasher.finish() as i64
}

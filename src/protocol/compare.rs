//! Rich comparisons: `<`, `<=`, `>`, `>=`, `==`, `!=`, `is`, `is not`,
//! `in`, `not in`.
//!
//! Grounded on the teacher's `vm/vm.rs::_cmp_op`'s "try the subclass's
//! reflected method first, then the forward method, then the other
//! operand's method" ordering for rich comparisons, and on `PyObject::rich_compare`
//! for mapping each `ComparisonOperator` to a dunder pair. `==`/`!=` reuse
//! `protocol::equality::value_eq` directly rather than re-deriving them
//! from `__lt__`/`__gt__`, matching spec.md §4.1's note that equality and
//! ordering are separate protocols.

use crate::bytecode::ComparisonOperator;
use crate::class::{find_dunder, PyClass};
use crate::value::{is_identical, PyObjectRef, Value};
use crate::vm::{PyResult, VirtualMachine};
use num_bigint::BigInt;

pub fn compare(vm: &VirtualMachine, op: ComparisonOperator, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<bool> {
    match op {
        ComparisonOperator::Is => Ok(is_identical(lhs, rhs)),
        ComparisonOperator::IsNot => Ok(!is_identical(lhs, rhs)),
        ComparisonOperator::Equal => crate::protocol::equality::value_eq(vm, lhs, rhs),
        ComparisonOperator::NotEqual => not_equal(vm, lhs, rhs),
        ComparisonOperator::In => crate::protocol::operator::contains(vm, rhs, lhs),
        ComparisonOperator::NotIn => Ok(!crate::protocol::operator::contains(vm, rhs, lhs)?),
        ComparisonOperator::ExceptionMatch => Ok(vm.is_instance(lhs, rhs)),
        ComparisonOperator::Less | ComparisonOperator::LessOrEqual | ComparisonOperator::Greater | ComparisonOperator::GreaterOrEqual => {
            ordering(vm, op, lhs, rhs)
        }
    }
}

/// Spec.md §9 open question (a): a user class that overrides only
/// `__eq__` gets the negation of it for `!=` (CPython's default
/// `object.__ne__` behavior) unless the class defines `__ne__` itself,
/// which takes priority — checked before falling back to `!value_eq`.
///
/// Subclass-priority dispatch: when `rhs`'s class is a strict subclass of
/// `lhs`'s, `rhs.__ne__` is tried first so an overriding subclass always
/// gets the first say, matching the forward/reflected ordering `ordering`
/// uses for `<`/`<=`/`>`/`>=`.
fn not_equal(vm: &VirtualMachine, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<bool> {
    let lhs_class = vm.class_of(lhs);
    let rhs_class = vm.class_of(rhs);
    let rhs_first = matches!(rhs.value, Value::Instance(_))
        && !is_identical(&lhs_class, &rhs_class)
        && PyClass::is_subclass_of(&rhs_class, &lhs_class);

    let order = if rhs_first { [(rhs, lhs), (lhs, rhs)] } else { [(lhs, rhs), (rhs, lhs)] };
    for (self_obj, other_obj) in order {
        if let Value::Instance(_) = &self_obj.value {
            let class = vm.class_of(self_obj);
            if let Some(method) = find_dunder(&class, "__ne__") {
                let result = crate::protocol::call::call_object_const(vm, &method, vec![self_obj.clone(), other_obj.clone()])?;
                if !matches!(result.value, Value::NotImplemented) {
                    return crate::protocol::operator::truthy(vm, &result);
                }
            }
        }
    }
    Ok(!crate::protocol::equality::value_eq(vm, lhs, rhs)?)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => num_traits::ToPrimitive::to_f64(i),
        Value::Bool(b) => Some(*b as i64 as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn numeric_ordering(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Bool(b)) => Some(a.cmp(&BigInt::from(*b as i64))),
        (Value::Bool(a), Value::Int(b)) => Some(BigInt::from(*a as i64).cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => as_f64(lhs).zip(as_f64(rhs)).and_then(|(a, b)| a.partial_cmp(&b)),
    }
}

fn ordering(vm: &VirtualMachine, op: ComparisonOperator, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<bool> {
    if let Some(ord) = numeric_ordering(&lhs.value, &rhs.value) {
        return Ok(apply(op, ord));
    }

    match (&lhs.value, &rhs.value) {
        (Value::Str(a), Value::Str(b)) => return Ok(apply(op, a.cmp(b))),
        (Value::Bytes(a), Value::Bytes(b)) => return Ok(apply(op, a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => return lexicographic(vm, op, a, b),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            return lexicographic(vm, op, &a, &b);
        }
        _ => {}
    }

    let (fwd, rev) = dunder_names(op);
    let lhs_class = vm.class_of(lhs);
    if let Some(method) = find_dunder(&lhs_class, fwd) {
        let result = crate::protocol::call::call_object_const(vm, &method, vec![lhs.clone(), rhs.clone()])?;
        if !matches!(result.value, Value::NotImplemented) {
            return crate::protocol::operator::truthy(vm, &result);
        }
    }
    let rhs_class = vm.class_of(rhs);
    if let Some(method) = find_dunder(&rhs_class, rev) {
        let result = crate::protocol::call::call_object_const(vm, &method, vec![rhs.clone(), lhs.clone()])?;
        if !matches!(result.value, Value::NotImplemented) {
            return crate::protocol::operator::truthy(vm, &result);
        }
    }

    Err(vm.new_type_error(format!(
        "'{}' not supported between instances of {:?} and {:?}",
        symbol(op),
        lhs.value,
        rhs.value
    )))
}

fn lexicographic(vm: &VirtualMachine, op: ComparisonOperator, a: &[PyObjectRef], b: &[PyObjectRef]) -> PyResult<bool> {
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => {
                if !crate::protocol::equality::value_eq(vm, x, y)? {
                    return ordering(vm, op, x, y);
                }
                i += 1;
            }
            (None, None) => return Ok(apply(op, std::cmp::Ordering::Equal)),
            (None, Some(_)) => return Ok(apply(op, std::cmp::Ordering::Less)),
            (Some(_), None) => return Ok(apply(op, std::cmp::Ordering::Greater)),
        }
    }
}

fn apply(op: ComparisonOperator, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        ComparisonOperator::Less => ord == Less,
        ComparisonOperator::LessOrEqual => ord != Greater,
        ComparisonOperator::Greater => ord == Greater,
        ComparisonOperator::GreaterOrEqual => ord != Less,
        _ => unreachable!("only ordering operators reach apply()"),
    }
}

fn dunder_names(op: ComparisonOperator) -> (&'static str, &'static str) {
    match op {
        ComparisonOperator::Less => ("__lt__", "__gt__"),
        ComparisonOperator::LessOrEqual => ("__le__", "__ge__"),
        ComparisonOperator::Greater => ("__gt__", "__lt__"),
        ComparisonOperator::GreaterOrEqual => ("__ge__", "__le__"),
        _ => unreachable!("only ordering operators reach dunder_names()"),
    }
}

fn symbol(op: ComparisonOperator) -> &'static str {
    match op {
        ComparisonOperator::Less => "<",
        ComparisonOperator::LessOrEqual => "<=",
        ComparisonOperator::Greater => ">",
        ComparisonOperator::GreaterOrEqual => ">=",
        _ => "?",
    }
}

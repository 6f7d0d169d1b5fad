//! Unary/binary operators, subscripting, truthiness, and `len()`.
//!
//! Grounded on the teacher's `vm/stdlib/... ` numeric-tower coercions and
//! `vm/vm.rs::_binary_op`'s "try forward dunder, then reflected dunder,
//! else TypeError" protocol. Python's floor-division/modulo sign
//! convention (`sign(a % b) == sign(b)`) is implemented directly per
//! spec.md §4.1, since `num-bigint`/`num-integer`'s own `div_mod_floor`
//! already has that convention for integers; floats reimplement it by
//! hand to match.

use crate::bytecode::{BinaryOperator, UnaryOperator};
use crate::class::find_dunder;
use crate::value::{PyObject, PyObjectRef, PyRange, Value};
use crate::vm::{PyResult, VirtualMachine};
use num_bigint::BigInt;
use num_complex::Complex64;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use std::cell::RefCell;
use std::rc::Rc;

pub fn truthy(vm: &VirtualMachine, obj: &PyObjectRef) -> PyResult<bool> {
    Ok(match &obj.value {
        Value::None => false,
        Value::NotImplemented => true,
        Value::Bool(b) => *b,
        Value::Int(i) => !i.is_zero(),
        Value::Float(f) => *f != 0.0,
        Value::Complex(c) => *c != Complex64::new(0.0, 0.0),
        Value::Str(s) => !s.is_empty(),
        Value::Bytes(b) => !b.is_empty(),
        Value::List(l) => !l.borrow().is_empty(),
        Value::Tuple(t) => !t.is_empty(),
        Value::Dict(d) => !d.borrow().is_empty(),
        Value::Set(s) => !s.borrow().is_empty(),
        Value::FrozenSet(s) => !s.is_empty(),
        Value::Range(r) => !r.is_empty(),
        Value::Instance(_) => {
            let class = vm.class_of(obj);
            if let Some(method) = find_dunder(&class, "__bool__") {
                let result = crate::protocol::call::call_object_const(vm, &method, vec![obj.clone()])?;
                return truthy(vm, &result);
            }
            if let Some(method) = find_dunder(&class, "__len__") {
                let result = crate::protocol::call::call_object_const(vm, &method, vec![obj.clone()])?;
                return truthy_from_int(vm, &result);
            }
            true
        }
        _ => true,
    })
}

fn truthy_from_int(vm: &VirtualMachine, v: &PyObjectRef) -> PyResult<bool> {
    match &v.value {
        Value::Int(i) => Ok(!i.is_zero()),
        _ => Err(vm.new_type_error("__len__ must return an int".to_owned())),
    }
}

pub fn len(vm: &VirtualMachine, obj: &PyObjectRef) -> PyResult<i64> {
    Ok(match &obj.value {
        Value::Str(s) => s.chars().count() as i64,
        Value::Bytes(b) => b.len() as i64,
        Value::List(l) => l.borrow().len() as i64,
        Value::Tuple(t) => t.len() as i64,
        Value::Dict(d) => d.borrow().len() as i64,
        Value::Set(s) => s.borrow().len() as i64,
        Value::FrozenSet(s) => s.len() as i64,
        Value::Range(r) => r.len().to_i64().unwrap_or(i64::MAX),
        Value::Instance(_) => {
            let class = vm.class_of(obj);
            let Some(method) = find_dunder(&class, "__len__") else {
                return Err(vm.new_type_error("object has no len()".to_owned()));
            };
            let result = crate::protocol::call::call_object_const(vm, &method, vec![obj.clone()])?;
            match &result.value {
                Value::Int(i) => i.to_i64().unwrap_or(0),
                _ => return Err(vm.new_type_error("__len__ must return an int".to_owned())),
            }
        }
        _ => return Err(vm.new_type_error("object has no len()".to_owned())),
    })
}

pub fn unary(vm: &VirtualMachine, op: UnaryOperator, v: &PyObjectRef) -> PyResult<PyObjectRef> {
    match (op, &v.value) {
        (UnaryOperator::Not, _) => Ok(vm.ctx.bool(!truthy(vm, v)?)),
        (UnaryOperator::Minus, Value::Int(i)) => Ok(vm.ctx.int(-i)),
        (UnaryOperator::Minus, Value::Float(f)) => Ok(float(vm, -f)),
        (UnaryOperator::Minus, Value::Complex(c)) => Ok(complex(vm, -c)),
        (UnaryOperator::Minus, Value::Bool(b)) => Ok(vm.ctx.int(-BigInt::from(*b as i64))),
        (UnaryOperator::Plus, Value::Int(i)) => Ok(vm.ctx.int(i.clone())),
        (UnaryOperator::Plus, Value::Float(f)) => Ok(float(vm, *f)),
        (UnaryOperator::Plus, Value::Complex(c)) => Ok(complex(vm, *c)),
        (UnaryOperator::Plus, Value::Bool(b)) => Ok(vm.ctx.int(BigInt::from(*b as i64))),
        (UnaryOperator::Invert, Value::Int(i)) => Ok(vm.ctx.int(!i)),
        (UnaryOperator::Invert, Value::Bool(b)) => Ok(vm.ctx.int(!BigInt::from(*b as i64))),
        _ => dispatch_unary_dunder(vm, op, v),
    }
}

fn dispatch_unary_dunder(vm: &VirtualMachine, op: UnaryOperator, v: &PyObjectRef) -> PyResult<PyObjectRef> {
    let name = match op {
        UnaryOperator::Minus => "__neg__",
        UnaryOperator::Plus => "__pos__",
        UnaryOperator::Invert => "__invert__",
        UnaryOperator::Not => unreachable!("handled above"),
    };
    let class = vm.class_of(v);
    if let Some(method) = find_dunder(&class, name) {
        return crate::protocol::call::call_object_const(vm, &method, vec![v.clone()]);
    }
    Err(vm.new_type_error(format!("bad operand type for unary {name}")))
}

fn float(vm: &VirtualMachine, f: f64) -> PyObjectRef {
    PyObject::new(Value::Float(f), Some(vm.ctx.object_class.clone()))
}

fn complex(vm: &VirtualMachine, c: Complex64) -> PyObjectRef {
    PyObject::new(Value::Complex(c), Some(vm.ctx.object_class.clone()))
}

fn bigint_to_f64(i: &BigInt) -> f64 {
    i.to_f64().unwrap_or(f64::NAN)
}

/// Python's floor-division/modulo convention: the remainder's sign always
/// matches the divisor's (spec.md §4.1).
fn py_divmod_f64(a: f64, b: f64) -> (f64, f64) {
    let q = (a / b).floor();
    let r = a - q * b;
    (q, r)
}

fn op_dunder_names(op: BinaryOperator) -> (&'static str, &'static str) {
    match op {
        BinaryOperator::Power => ("__pow__", "__rpow__"),
        BinaryOperator::Multiply => ("__mul__", "__rmul__"),
        BinaryOperator::Divide => ("__truediv__", "__rtruediv__"),
        BinaryOperator::FloorDivide => ("__floordiv__", "__rfloordiv__"),
        BinaryOperator::Modulo => ("__mod__", "__rmod__"),
        BinaryOperator::Add => ("__add__", "__radd__"),
        BinaryOperator::Subtract => ("__sub__", "__rsub__"),
        BinaryOperator::Lshift => ("__lshift__", "__rlshift__"),
        BinaryOperator::Rshift => ("__rshift__", "__rrshift__"),
        BinaryOperator::And => ("__and__", "__rand__"),
        BinaryOperator::Xor => ("__xor__", "__rxor__"),
        BinaryOperator::Or => ("__or__", "__ror__"),
    }
}

fn inplace_dunder_name(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Power => "__ipow__",
        BinaryOperator::Multiply => "__imul__",
        BinaryOperator::Divide => "__itruediv__",
        BinaryOperator::FloorDivide => "__ifloordiv__",
        BinaryOperator::Modulo => "__imod__",
        BinaryOperator::Add => "__iadd__",
        BinaryOperator::Subtract => "__isub__",
        BinaryOperator::Lshift => "__ilshift__",
        BinaryOperator::Rshift => "__irshift__",
        BinaryOperator::And => "__iand__",
        BinaryOperator::Xor => "__ixor__",
        BinaryOperator::Or => "__ior__",
    }
}

pub fn binary(
    vm: &VirtualMachine,
    op: BinaryOperator,
    lhs: &PyObjectRef,
    rhs: &PyObjectRef,
    inplace: bool,
) -> PyResult<PyObjectRef> {
    if inplace {
        let class = vm.class_of(lhs);
        if let Some(method) = find_dunder(&class, inplace_dunder_name(op)) {
            let result = crate::protocol::call::call_object_const(vm, &method, vec![lhs.clone(), rhs.clone()])?;
            if !matches!(result.value, Value::NotImplemented) {
                return Ok(result);
            }
        }
    }

    if let Some(result) = numeric_binary(vm, op, lhs, rhs)? {
        return Ok(result);
    }

    if matches!(op, BinaryOperator::Add) {
        if let Some(result) = sequence_add(vm, lhs, rhs)? {
            return Ok(result);
        }
    }
    if matches!(op, BinaryOperator::Multiply) {
        if let Some(result) = sequence_repeat(vm, lhs, rhs)? {
            return Ok(result);
        }
    }
    if matches!(
        op,
        BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Xor | BinaryOperator::Subtract
    ) {
        if let Some(result) = set_algebra(vm, op, lhs, rhs)? {
            return Ok(result);
        }
    }
    if matches!(op, BinaryOperator::Modulo) {
        if let Some(result) = string_modulo(vm, lhs, rhs)? {
            return Ok(result);
        }
    }

    let (fwd, rev) = op_dunder_names(op);
    let lhs_class = vm.class_of(lhs);
    if let Some(method) = find_dunder(&lhs_class, fwd) {
        let result = crate::protocol::call::call_object_const(vm, &method, vec![lhs.clone(), rhs.clone()])?;
        if !matches!(result.value, Value::NotImplemented) {
            return Ok(result);
        }
    }
    let rhs_class = vm.class_of(rhs);
    if let Some(method) = find_dunder(&rhs_class, rev) {
        let result = crate::protocol::call::call_object_const(vm, &method, vec![rhs.clone(), lhs.clone()])?;
        if !matches!(result.value, Value::NotImplemented) {
            return Ok(result);
        }
    }

    Err(vm.new_type_error(format!(
        "unsupported operand type(s) for {fwd}: {:?} and {:?}",
        lhs.value, rhs.value
    )))
}

fn as_bigint(v: &Value) -> Option<BigInt> {
    match v {
        Value::Int(i) => Some(i.clone()),
        Value::Bool(b) => Some(BigInt::from(*b as i64)),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(bigint_to_f64(i)),
        Value::Bool(b) => Some(*b as i64 as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn as_complex(v: &Value) -> Option<Complex64> {
    match v {
        Value::Complex(c) => Some(*c),
        _ => as_f64(v).map(|f| Complex64::new(f, 0.0)),
    }
}

/// Numeric-tower binary ops: int/bool, float, complex, with the usual
/// promotion ladder (bool -> int -> float -> complex).
fn numeric_binary(
    vm: &VirtualMachine,
    op: BinaryOperator,
    lhs: &PyObjectRef,
    rhs: &PyObjectRef,
) -> PyResult<Option<PyObjectRef>> {
    let is_numeric = |v: &Value| matches!(v, Value::Int(_) | Value::Bool(_) | Value::Float(_) | Value::Complex(_));
    if !is_numeric(&lhs.value) || !is_numeric(&rhs.value) {
        return Ok(None);
    }

    if matches!(lhs.value, Value::Complex(_)) || matches!(rhs.value, Value::Complex(_)) {
        let (a, b) = (as_complex(&lhs.value).unwrap(), as_complex(&rhs.value).unwrap());
        return Ok(Some(complex_op(vm, op, a, b)?));
    }

    if matches!(lhs.value, Value::Float(_)) || matches!(rhs.value, Value::Float(_)) {
        let (a, b) = (as_f64(&lhs.value).unwrap(), as_f64(&rhs.value).unwrap());
        return Ok(Some(float_op(vm, op, a, b)?));
    }

    let (a, b) = (as_bigint(&lhs.value).unwrap(), as_bigint(&rhs.value).unwrap());
    int_op(vm, op, a, b).map(Some)
}

fn int_op(vm: &VirtualMachine, op: BinaryOperator, a: BigInt, b: BigInt) -> PyResult<PyObjectRef> {
    Ok(match op {
        BinaryOperator::Add => vm.ctx.int(a + b),
        BinaryOperator::Subtract => vm.ctx.int(a - b),
        BinaryOperator::Multiply => vm.ctx.int(a * b),
        BinaryOperator::Power => {
            if b.is_negative() {
                return Ok(float(vm, bigint_to_f64(&a).powf(bigint_to_f64(&b))));
            }
            let exp = b.to_u32().ok_or_else(|| vm.new_value_error("exponent too large".to_owned()))?;
            vm.ctx.int(a.pow(exp))
        }
        BinaryOperator::Divide => {
            if b.is_zero() {
                return Err(vm.new_zero_division_error("division by zero".to_owned()));
            }
            float(vm, bigint_to_f64(&a) / bigint_to_f64(&b))
        }
        BinaryOperator::FloorDivide => {
            if b.is_zero() {
                return Err(vm.new_zero_division_error("integer division or modulo by zero".to_owned()));
            }
            vm.ctx.int(a.div_floor(&b))
        }
        BinaryOperator::Modulo => {
            if b.is_zero() {
                return Err(vm.new_zero_division_error("integer division or modulo by zero".to_owned()));
            }
            vm.ctx.int(a.mod_floor(&b))
        }
        BinaryOperator::Lshift => {
            let shift = b.to_u32().ok_or_else(|| vm.new_value_error("shift too large".to_owned()))?;
            vm.ctx.int(a << shift)
        }
        BinaryOperator::Rshift => {
            let shift = b.to_u32().ok_or_else(|| vm.new_value_error("shift too large".to_owned()))?;
            vm.ctx.int(a >> shift)
        }
        BinaryOperator::And => vm.ctx.int(a & b),
        BinaryOperator::Xor => vm.ctx.int(a ^ b),
        BinaryOperator::Or => vm.ctx.int(a | b),
    })
}

fn float_op(vm: &VirtualMachine, op: BinaryOperator, a: f64, b: f64) -> PyResult<PyObjectRef> {
    Ok(match op {
        BinaryOperator::Add => float(vm, a + b),
        BinaryOperator::Subtract => float(vm, a - b),
        BinaryOperator::Multiply => float(vm, a * b),
        BinaryOperator::Divide => {
            if b == 0.0 {
                return Err(vm.new_zero_division_error("float division by zero".to_owned()));
            }
            float(vm, a / b)
        }
        BinaryOperator::FloorDivide => {
            if b == 0.0 {
                return Err(vm.new_zero_division_error("float floor division by zero".to_owned()));
            }
            float(vm, py_divmod_f64(a, b).0)
        }
        BinaryOperator::Modulo => {
            if b == 0.0 {
                return Err(vm.new_zero_division_error("float modulo".to_owned()));
            }
            float(vm, py_divmod_f64(a, b).1)
        }
        BinaryOperator::Power => float(vm, a.powf(b)),
        BinaryOperator::Lshift | BinaryOperator::Rshift | BinaryOperator::And | BinaryOperator::Xor | BinaryOperator::Or => {
            return Err(vm.new_type_error("unsupported operand type(s): float".to_owned()));
        }
    })
}

fn complex_op(vm: &VirtualMachine, op: BinaryOperator, a: Complex64, b: Complex64) -> PyResult<PyObjectRef> {
    Ok(match op {
        BinaryOperator::Add => complex(vm, a + b),
        BinaryOperator::Subtract => complex(vm, a - b),
        BinaryOperator::Multiply => complex(vm, a * b),
        BinaryOperator::Divide => {
            if b == Complex64::new(0.0, 0.0) {
                return Err(vm.new_zero_division_error("complex division by zero".to_owned()));
            }
            complex(vm, a / b)
        }
        BinaryOperator::Power => complex(vm, a.powc(b)),
        _ => return Err(vm.new_type_error("unsupported operand type(s): complex".to_owned())),
    })
}

fn sequence_add(vm: &VirtualMachine, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
    match (&lhs.value, &rhs.value) {
        (Value::Str(a), Value::Str(b)) => {
            check_byte_ceiling(vm, a.len() + b.len())?;
            Ok(Some(PyObject::new(
                Value::Str(Rc::from(format!("{a}{b}").as_str())),
                Some(vm.ctx.object_class.clone()),
            )))
        }
        (Value::Bytes(a), Value::Bytes(b)) => {
            check_byte_ceiling(vm, a.len() + b.len())?;
            let mut v = a.to_vec();
            v.extend_from_slice(b);
            Ok(Some(PyObject::new(Value::Bytes(Rc::from(v)), Some(vm.ctx.object_class.clone()))))
        }
        (Value::List(a), Value::List(b)) => {
            let mut v = a.borrow().clone();
            v.extend(b.borrow().iter().cloned());
            Ok(Some(PyObject::new(Value::List(RefCell::new(v)), Some(vm.ctx.object_class.clone()))))
        }
        (Value::Tuple(a), Value::Tuple(b)) => {
            let mut v = a.to_vec();
            v.extend(b.iter().cloned());
            Ok(Some(PyObject::new(Value::Tuple(Rc::from(v)), Some(vm.ctx.object_class.clone()))))
        }
        _ => Ok(None),
    }
}

fn as_set_items(v: &Value) -> Option<Vec<PyObjectRef>> {
    match v {
        Value::Set(s) => Some(s.borrow().iter().collect()),
        Value::FrozenSet(s) => Some(s.iter().collect()),
        _ => None,
    }
}

/// `|`/`&`/`-`/`^` on `set`/`frozenset` (spec.md's type-specific fallback
/// list): result is a plain `set` unless `lhs` is a `frozenset`, matching
/// the usual forward-dunder-wins priority (`type(a).__and__` etc).
fn set_algebra(
    vm: &VirtualMachine,
    op: BinaryOperator,
    lhs: &PyObjectRef,
    rhs: &PyObjectRef,
) -> PyResult<Option<PyObjectRef>> {
    let (Some(a_items), Some(b_items)) = (as_set_items(&lhs.value), as_set_items(&rhs.value)) else {
        return Ok(None);
    };
    let mut a = crate::dict::PySet::new();
    for item in a_items {
        a.add(vm, item)?;
    }
    let mut b = crate::dict::PySet::new();
    for item in b_items {
        b.add(vm, item)?;
    }
    let result = match op {
        BinaryOperator::Or => a.union(vm, &b)?,
        BinaryOperator::And => a.intersection(vm, &b)?,
        BinaryOperator::Subtract => a.difference(vm, &b)?,
        BinaryOperator::Xor => a.symmetric_difference(vm, &b)?,
        _ => return Ok(None),
    };
    let value = if matches!(lhs.value, Value::FrozenSet(_)) {
        Value::FrozenSet(Rc::new(result))
    } else {
        Value::Set(RefCell::new(result))
    };
    Ok(Some(PyObject::new(value, Some(vm.ctx.object_class.clone()))))
}

/// `%`-style string interpolation (spec.md's type-specific fallback list):
/// a small, commonly-used subset (`%s`, `%r`, `%d`, `%%`), not CPython's
/// full field-width/precision grammar.
fn string_modulo(vm: &VirtualMachine, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
    let Value::Str(fmt) = &lhs.value else {
        return Ok(None);
    };
    let args: Vec<PyObjectRef> = match &rhs.value {
        Value::Tuple(items) => items.to_vec(),
        _ => vec![rhs.clone()],
    };
    let mut arg_iter = args.into_iter();
    let mut next_arg = || {
        arg_iter
            .next()
            .ok_or_else(|| vm.new_type_error("not enough arguments for format string".to_owned()))
    };

    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') | Some('r') => out.push_str(&crate::builtins_core::display_string(vm, &next_arg()?)?),
            Some('d') => match &next_arg()?.value {
                Value::Int(i) => out.push_str(&i.to_string()),
                Value::Bool(b) => out.push_str(if *b { "1" } else { "0" }),
                other => return Err(vm.new_type_error(format!("%d format: a number is required, not {other:?}"))),
            },
            Some(other) => return Err(vm.new_type_error(format!("unsupported format character '{other}'"))),
            None => return Err(vm.new_type_error("incomplete format".to_owned())),
        }
    }
    Ok(Some(PyObject::new(Value::Str(Rc::from(out.as_str())), Some(vm.ctx.object_class.clone()))))
}

fn sequence_repeat(vm: &VirtualMachine, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
    let (seq, n) = match (&lhs.value, &rhs.value) {
        (Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Bytes(_), Value::Int(n)) => (lhs, n.clone()),
        (Value::Int(n), Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Bytes(_)) => (rhs, n.clone()),
        _ => return Ok(None),
    };
    let n = n.to_i64().unwrap_or(0).max(0) as usize;
    match &seq.value {
        Value::List(items) => {
            let base = items.borrow();
            check_item_ceiling(vm, base.len().saturating_mul(n))?;
            let mut out = Vec::with_capacity(base.len() * n);
            for _ in 0..n {
                out.extend(base.iter().cloned());
            }
            Ok(Some(PyObject::new(Value::List(RefCell::new(out)), Some(vm.ctx.object_class.clone()))))
        }
        Value::Tuple(items) => {
            check_item_ceiling(vm, items.len().saturating_mul(n))?;
            let mut out = Vec::with_capacity(items.len() * n);
            for _ in 0..n {
                out.extend(items.iter().cloned());
            }
            Ok(Some(PyObject::new(Value::Tuple(Rc::from(out)), Some(vm.ctx.object_class.clone()))))
        }
        Value::Str(s) => {
            check_byte_ceiling(vm, s.len().saturating_mul(n))?;
            Ok(Some(PyObject::new(Value::Str(Rc::from(s.repeat(n).as_str())), Some(vm.ctx.object_class.clone()))))
        }
        Value::Bytes(b) => {
            check_byte_ceiling(vm, b.len().saturating_mul(n))?;
            Ok(Some(PyObject::new(Value::Bytes(Rc::from(b.repeat(n))), Some(vm.ctx.object_class.clone()))))
        }
        _ => Ok(None),
    }
}

fn check_byte_ceiling(vm: &VirtualMachine, size: usize) -> PyResult<()> {
    if size > vm.settings.sequence_byte_ceiling {
        return Err(vm.new_value_error("sequence too large".to_owned()));
    }
    Ok(())
}

fn check_item_ceiling(vm: &VirtualMachine, size: usize) -> PyResult<()> {
    if size > vm.settings.sequence_repeat_item_ceiling {
        return Err(vm.new_value_error("repeated sequence too large".to_owned()));
    }
    Ok(())
}

pub fn getitem(vm: &VirtualMachine, obj: &PyObjectRef, index: &PyObjectRef) -> PyResult<PyObjectRef> {
    match &obj.value {
        Value::List(items) => index_sequence(vm, &items.borrow(), index).map(|v| v.clone()),
        Value::Tuple(items) => index_sequence(vm, items, index).map(|v| v.clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(vm, chars.len(), index)?;
            Ok(PyObject::new(
                Value::Str(Rc::from(chars[i].to_string().as_str())),
                Some(vm.ctx.object_class.clone()),
            ))
        }
        Value::Bytes(b) => {
            let i = normalize_index(vm, b.len(), index)?;
            Ok(vm.ctx.int(BigInt::from(b[i])))
        }
        Value::Dict(d) => d
            .borrow()
            .get(vm, index)?
            .ok_or_else(|| vm.new_key_error(format!("{:?}", index.value))),
        Value::Range(r) => {
            let Value::Int(i) = &index.value else {
                return Err(vm.new_type_error("range indices must be integers".to_owned()));
            };
            Ok(vm.ctx.int(r.nth(i)))
        }
        Value::Instance(_) => {
            let class = vm.class_of(obj);
            let Some(method) = find_dunder(&class, "__getitem__") else {
                return Err(vm.new_type_error("object is not subscriptable".to_owned()));
            };
            crate::protocol::call::call_object_const(vm, &method, vec![obj.clone(), index.clone()])
        }
        _ => Err(vm.new_type_error("object is not subscriptable".to_owned())),
    }
}

fn index_sequence<'a>(vm: &VirtualMachine, items: &'a [PyObjectRef], index: &PyObjectRef) -> PyResult<&'a PyObjectRef> {
    let i = normalize_index(vm, items.len(), index)?;
    Ok(&items[i])
}

fn normalize_index(vm: &VirtualMachine, len: usize, index: &PyObjectRef) -> PyResult<usize> {
    let Value::Int(i) = &index.value else {
        return Err(vm.new_type_error("indices must be integers".to_owned()));
    };
    let i = i.to_i64().ok_or_else(|| vm.new_index_error("index out of range".to_owned()))?;
    let normalized = if i < 0 { i + len as i64 } else { i };
    if normalized < 0 || normalized as usize >= len {
        return Err(vm.new_index_error("index out of range".to_owned()));
    }
    Ok(normalized as usize)
}

pub fn setitem(vm: &VirtualMachine, obj: &PyObjectRef, index: &PyObjectRef, value: PyObjectRef) -> PyResult<()> {
    match &obj.value {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(vm, items.len(), index)?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(d) => {
            d.borrow_mut().insert(vm, index.clone(), value)?;
            Ok(())
        }
        Value::Instance(_) => {
            let class = vm.class_of(obj);
            let Some(method) = find_dunder(&class, "__setitem__") else {
                return Err(vm.new_type_error("object does not support item assignment".to_owned()));
            };
            crate::protocol::call::call_object_const(vm, &method, vec![obj.clone(), index.clone(), value])?;
            Ok(())
        }
        _ => Err(vm.new_type_error("object does not support item assignment".to_owned())),
    }
}

pub fn delitem(vm: &VirtualMachine, obj: &PyObjectRef, index: &PyObjectRef) -> PyResult<()> {
    match &obj.value {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(vm, items.len(), index)?;
            items.remove(i);
            Ok(())
        }
        Value::Dict(d) => {
            if d.borrow_mut().remove(vm, index)?.is_none() {
                return Err(vm.new_key_error(format!("{:?}", index.value)));
            }
            Ok(())
        }
        _ => Err(vm.new_type_error("object does not support item deletion".to_owned())),
    }
}

/// `in`/`not in`, grounded on spec.md §4.1's "containment protocol":
/// dict/set membership is key lookup; sequences fall back to linear
/// `==` scan; instances dispatch to `__contains__`.
pub fn contains(vm: &VirtualMachine, container: &PyObjectRef, item: &PyObjectRef) -> PyResult<bool> {
    match &container.value {
        Value::Dict(d) => d.borrow().contains(vm, item),
        Value::Set(s) => s.borrow().contains(vm, item),
        Value::FrozenSet(s) => s.contains(vm, item),
        Value::List(items) => {
            for existing in items.borrow().iter() {
                if crate::protocol::equality::value_eq(vm, existing, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Tuple(items) => {
            for existing in items.iter() {
                if crate::protocol::equality::value_eq(vm, existing, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Str(s) => match &item.value {
            Value::Str(needle) => Ok(s.contains(needle.as_ref())),
            _ => Err(vm.new_type_error("'in <string>' requires string as left operand".to_owned())),
        },
        Value::Range(r) => match &item.value {
            Value::Int(i) => Ok(range_contains(r, i)),
            _ => Ok(false),
        },
        Value::Instance(_) => {
            let class = vm.class_of(container);
            if let Some(method) = find_dunder(&class, "__contains__") {
                let result = crate::protocol::call::call_object_const(vm, &method, vec![container.clone(), item.clone()])?;
                return truthy(vm, &result);
            }
            Err(vm.new_type_error("argument is not iterable".to_owned()))
        }
        _ => Err(vm.new_type_error("argument is not iterable".to_owned())),
    }
}

fn range_contains(r: &PyRange, i: &BigInt) -> bool {
    if r.step.is_positive() {
        i >= &r.start && i < &r.stop && (i - &r.start).is_multiple_of(&r.step)
    } else if r.step.is_negative() {
        i <= &r.start && i > &r.stop && (&r.start - i).is_multiple_of(&(-&r.step))
    } else {
        false
    }
}

//! Iterator state for `GetIter`/`ForIter`, and the two iteration modes
//! spec.md §9 open question (b) asks us to settle.
//!
//! Grounded on the teacher's `iter.rs`/`builtins/iter.rs` (`PySequenceIterator`
//! holding a position plus a reference to the underlying sequence rather
//! than a snapshot). We resolve open question (b) the same way: iterating
//! a `list` holds a *live reference* to it (mutations during iteration are
//! visible, matching CPython's actual — if famously surprising — list
//! iterator behavior), documented in `DESIGN.md`.

use crate::value::{PyObjectRef, Value};
use crate::vm::{PyResult, VirtualMachine};
use num_bigint::BigInt;
use num_traits::ToPrimitive;

/// The state backing `Value::Iterator`.
#[derive(Clone)]
pub enum PyIteratorState {
    /// Live-reference iteration over a `list`/`tuple`: position plus the
    /// sequence object itself, re-read on every `next()`.
    Sequence { source: PyObjectRef, position: usize },
    /// `range(...)` iteration: stepping over `PyRange` without
    /// materializing it.
    Range { source: PyObjectRef, position: BigInt },
    /// Iteration over an already-materialized snapshot (`dict.keys()` /
    /// `.values()` / `.items()`, `set` iteration, `str`/`bytes` iteration):
    /// copied once up front since dict/set entries aren't index-addressable
    /// the way list/tuple are.
    Materialized { items: Vec<PyObjectRef>, position: usize },
    Exhausted,
}

/// `next(iterator)`: `Ok(None)` signals exhaustion to callers that prefer
/// not to deal with `StopIteration` as a control-flow exception (e.g. the
/// `FOR_ITER` opcode); `vm`-facing `__next__` wraps this and raises
/// `StopIteration` itself.
pub fn advance(vm: &VirtualMachine, state: &mut PyIteratorState) -> PyResult<Option<PyObjectRef>> {
    match state {
        PyIteratorState::Sequence { source, position } => {
            let item = match &source.value {
                Value::List(items) => items.borrow().get(*position).cloned(),
                Value::Tuple(items) => items.get(*position).cloned(),
                _ => None,
            };
            match item {
                Some(v) => {
                    *position += 1;
                    Ok(Some(v))
                }
                None => {
                    *state = PyIteratorState::Exhausted;
                    Ok(None)
                }
            }
        }
        PyIteratorState::Range { source, position } => {
            let Value::Range(range) = &source.value else {
                *state = PyIteratorState::Exhausted;
                return Ok(None);
            };
            let len = range.len();
            let idx_for_len = {
                // position is an absolute range value; recover the 0-based
                // index by inverting `nth` for comparison against `len`.
                if range.step.sign() == num_bigint::Sign::Minus {
                    (&range.start - &*position) / (-&range.step)
                } else {
                    (&*position - &range.start) / &range.step
                }
            };
            if idx_for_len >= len {
                *state = PyIteratorState::Exhausted;
                return Ok(None);
            }
            let value = position.clone();
            *position += &range.step;
            Ok(Some(vm.ctx.int(value)))
        }
        PyIteratorState::Materialized { items, position } => {
            if let Some(v) = items.get(*position).cloned() {
                *position += 1;
                Ok(Some(v))
            } else {
                *state = PyIteratorState::Exhausted;
                Ok(None)
            }
        }
        PyIteratorState::Exhausted => Ok(None),
    }
}

/// `GET_ITER`: produce the appropriate `PyIteratorState` for a value,
/// per the iterable families spec.md §4.2/§6 enumerates.
pub fn get_iter(vm: &VirtualMachine, obj: &PyObjectRef) -> PyResult<PyIteratorState> {
    match &obj.value {
        Value::List(_) | Value::Tuple(_) => Ok(PyIteratorState::Sequence {
            source: obj.clone(),
            position: 0,
        }),
        Value::Range(range) => Ok(PyIteratorState::Range {
            source: obj.clone(),
            position: range.start.clone(),
        }),
        Value::Str(s) => Ok(PyIteratorState::Materialized {
            items: s
                .chars()
                .map(|c| {
                    crate::value::PyObject::new(
                        Value::Str(std::rc::Rc::from(c.to_string().as_str())),
                        Some(vm.ctx.object_class.clone()),
                    )
                })
                .collect(),
            position: 0,
        }),
        Value::Bytes(b) => Ok(PyIteratorState::Materialized {
            items: b
                .iter()
                .map(|byte| vm.ctx.int(BigInt::from(*byte)))
                .collect(),
            position: 0,
        }),
        Value::Dict(d) => Ok(PyIteratorState::Materialized {
            items: d.borrow().keys().collect(),
            position: 0,
        }),
        Value::Set(s) => Ok(PyIteratorState::Materialized {
            items: s.borrow().iter().collect(),
            position: 0,
        }),
        Value::FrozenSet(s) => Ok(PyIteratorState::Materialized {
            items: s.iter().collect(),
            position: 0,
        }),
        Value::Iterator(state) => {
            // already an iterator: GET_ITER on an iterator returns itself.
            Ok(state.borrow().clone())
        }
        _ => Err(vm.new_type_error(format!("{:?} is not iterable", obj.value))),
    }
}

/// Best-effort length hint, used by `BUILD_LIST`/`BUILD_TUPLE` unpacking
/// to preallocate; never authoritative.
pub fn length_hint(obj: &PyObjectRef) -> Option<usize> {
    match &obj.value {
        Value::List(items) => Some(items.borrow().len()),
        Value::Tuple(items) => Some(items.len()),
        Value::Range(r) => r.len().to_usize(),
        _ => None,
    }
}

//! Classes, instances, and C3 method-resolution order.
//!
//! Grounded on the teacher's `builtins/type.rs`: `linearise_mro` and
//! `take_next_base` are transcribed close to verbatim (same local-
//! precedence-ordering check, same "merge one consistent head at a time"
//! loop), and `calculate_meta_class`'s "most-derived metaclass wins" rule
//! is followed for metaclass selection. The proc-macro-driven
//! `PyClassImpl`/`StaticType` bootstrap machinery is not reproduced —
//! spec.md's object model doesn't need compile-time-registered native
//! classes, just the MRO/dunder-lookup algorithm, so built-in classes here
//! are plain values created at VM-bootstrap time (`builtins_core`).

use crate::dict::PyDict;
use crate::value::{PyObject, PyObjectRef, Value};
use crate::vm::{PyResult, VirtualMachine};
use indexmap::IndexMap;
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::rc::Rc;

/// A class's own attribute table: name -> value, insertion-ordered.
/// Grounded directly on the teacher's `builtins/type.rs::PyAttributes`
/// (`IndexMap<&PyStrInterned, PyObjectRef, ahash::RandomState>`) — class
/// bodies never need the full `Dict`'s user-`__hash__` dispatch, since
/// attribute names are always plain Rust strings, so a lighter ordered map
/// keyed on `Rc<str>` is enough.
pub type PyAttributes = IndexMap<Rc<str>, PyObjectRef>;

/// A class object: name, bases, a precomputed immutable C3 MRO, a mutable
/// attribute dict, and a metaclass. Spec.md §3 "Class MRO ... is
/// linearized when the class is created and is immutable thereafter".
pub struct PyClass {
    pub name: Rc<str>,
    pub bases: Vec<PyObjectRef>,
    pub mro: Vec<PyObjectRef>,
    pub attrs: RefCell<PyAttributes>,
    pub metaclass: RefCell<Option<PyObjectRef>>,
    /// `true` for exception classes rooted at `BaseException`; governs the
    /// `args`-on-construction rule in the call protocol (spec.md §4.1).
    pub is_exception: bool,
    /// Lazily-built cache for `full_mro` (the hottest path in attribute
    /// lookup): `mro` is already fixed at construction, so the only thing
    /// `full_mro` computes on each call is prepending `self`, which this
    /// memoizes after the first call. Grounded on the teacher's
    /// `OnceCell<i64>`/`OnceCell<usize>` memoized fields on
    /// `bytecode.rs::StringData`; `unsync` since this crate is single-threaded.
    pub full_mro_cache: OnceCell<Vec<PyObjectRef>>,
}

/// An ordinary (non-exception, non-builtin) object: a class pointer plus
/// its own attribute dict. Built-in containers (list/dict/...) are
/// `Value` variants directly rather than `Instance`s; `Instance` is what
/// user `class Foo: ...` definitions produce.
pub struct PyInstance {
    pub class: Rc<PyClass>,
    pub dict: Rc<RefCell<PyDict>>,
}

impl Clone for PyInstance {
    fn clone(&self) -> Self {
        PyInstance {
            class: self.class.clone(),
            dict: self.dict.clone(),
        }
    }
}

/// Pull `Rc<PyClass>` out of a class-valued object, for code that already
/// knows `obj` is a class (e.g. after `vm.class_of`).
pub fn as_class(obj: &PyObjectRef) -> Option<Rc<PyClass>> {
    match &obj.value {
        Value::Class(c) => Some(c.clone()),
        _ => None,
    }
}

/// CPython's `take_next_base`: pick the first candidate head that does not
/// appear in the tail of any other list, consuming it from every list it
/// heads.
fn take_next_base(bases: &mut [Vec<PyObjectRef>]) -> Option<PyObjectRef> {
    for base in bases.iter() {
        if base.is_empty() {
            continue;
        }
        let head = base[0].clone();
        let in_some_tail = bases
            .iter()
            .any(|b| b[1..].iter().any(|c| Rc::ptr_eq(c, &head)));
        if !in_some_tail {
            for item in bases.iter_mut() {
                if !item.is_empty() && Rc::ptr_eq(&item[0], &head) {
                    item.remove(0);
                }
            }
            return Some(head);
        }
    }
    None
}

/// C3 linearization. `bases` is one MRO list per direct base (each list's
/// own `mro[0]` is that base itself).
pub fn linearize_mro(bases: Vec<Vec<PyObjectRef>>) -> Result<Vec<PyObjectRef>, String> {
    // Local precedence ordering: no direct base may appear in the tail of
    // a later direct base's MRO.
    for (i, base_mro) in bases.iter().enumerate() {
        if base_mro.is_empty() {
            continue;
        }
        let base = &base_mro[0];
        for later in &bases[i + 1..] {
            if later[1..].iter().any(|c| Rc::ptr_eq(c, base)) {
                return Err(
                    "Unable to find mro order which keeps local precedence ordering".to_owned(),
                );
            }
        }
    }

    let mut bases = bases;
    let mut result = Vec::new();
    while bases.iter().any(|b| !b.is_empty()) {
        let head = take_next_base(&mut bases).ok_or_else(|| {
            "Cannot create a consistent method resolution order (MRO) for bases given".to_owned()
        })?;
        result.push(head);
    }
    Ok(result)
}

/// Build a new class object, computing its MRO from `bases` (defaulting to
/// `[object]` if empty) and its metaclass (most-derived among the
/// explicit `metaclass` argument and the bases' own metaclasses).
pub fn new_class(
    vm: &VirtualMachine,
    name: &str,
    bases: Vec<PyObjectRef>,
    attrs: PyAttributes,
    explicit_metaclass: Option<PyObjectRef>,
) -> PyResult<PyObjectRef> {
    let bases = if bases.is_empty() {
        vec![vm.ctx.object_class.clone()]
    } else {
        bases
    };

    let mut base_mros = Vec::with_capacity(bases.len());
    for b in &bases {
        if as_class(b).is_none() {
            return Err(vm.new_type_error("bases must be classes".to_owned()));
        };
        // `linearize_mro` wants each list headed by the base itself
        // (`full_mro`, not the self-excluded `mro` field).
        base_mros.push(PyClass::full_mro(b));
    }

    let is_exception = bases.iter().any(|b| {
        as_class(b)
            .map(|c| c.is_exception || Rc::ptr_eq(b, &vm.ctx.exceptions.base_exception))
            .unwrap_or(false)
    });

    let mro_tail =
        linearize_mro(base_mros).map_err(|e| vm.new_type_error(format!("MRO conflict: {e}")))?;

    let metaclass = explicit_metaclass.unwrap_or_else(|| vm.ctx.type_class.clone());

    let class = Rc::new(PyClass {
        name: name.into(),
        bases: bases.clone(),
        // The class itself is *not* stored here; `mro` is the linearized
        // tail over the bases only. `PyClass::full_mro` prepends `self` on
        // every read, since we don't have our own `PyObjectRef` yet at
        // construction time (mirrors the teacher's two-step
        // `new_type.mro.write().insert(0, new_type.clone())`, but without
        // needing interior mutability on an otherwise-immutable field).
        mro: mro_tail,
        attrs: RefCell::new(attrs),
        metaclass: RefCell::new(Some(metaclass)),
        is_exception,
        full_mro_cache: OnceCell::new(),
    });

    let obj = PyObject::new(Value::Class(class), Some(vm.ctx.type_class.clone()));
    Ok(obj)
}

impl PyClass {
    /// The complete MRO, with the class itself prepended (spec.md §3:
    /// "always begins with the class itself").
    pub fn full_mro(self_obj: &PyObjectRef) -> Vec<PyObjectRef> {
        let Value::Class(c) = &self_obj.value else {
            return vec![self_obj.clone()];
        };
        c.full_mro_cache
            .get_or_init(|| {
                let mut out = Vec::with_capacity(c.mro.len() + 1);
                out.push(self_obj.clone());
                out.extend(c.mro.iter().cloned());
                out
            })
            .clone()
    }

    pub fn is_subclass_of(self_obj: &PyObjectRef, other: &PyObjectRef) -> bool {
        Self::full_mro(self_obj).iter().any(|c| Rc::ptr_eq(c, other))
    }
}

/// `find_name_in_mro` (teacher naming kept): walk `obj`'s MRO looking for
/// `name` in each class's own attribute dict, returning the first hit.
pub fn find_dunder(class_obj: &PyObjectRef, name: &str) -> Option<PyObjectRef> {
    for cls in PyClass::full_mro(class_obj) {
        if let Value::Class(c) = &cls.value {
            if let Some(v) = c.attrs.borrow().get(name) {
                return Some(v.clone());
            }
        }
    }
    None
}

impl PyDict {
    /// Lookup by a plain Rust `&str` key, used for dunder/attribute name
    /// lookups where the key is always an interned identifier rather than
    /// an arbitrary hashable `Value`. Implemented without needing a
    /// `VirtualMachine` since string hashing/equality never dispatches to
    /// user code.
    pub fn get_plain(&self, name: &str) -> PyResult<Option<PyObjectRef>> {
        for (k, v) in self.iter() {
            if let Value::Str(s) = &k.value {
                if &**s == name {
                    return Ok(Some(v));
                }
            }
        }
        Ok(None)
    }

    /// Convert a `StoreName`-populated namespace dict (e.g. a class body's
    /// globals) into a `PyAttributes` table, used at class-construction
    /// time once the body has finished executing.
    pub fn to_attributes(&self) -> PyAttributes {
        let mut out = PyAttributes::new();
        for (k, v) in self.iter() {
            if let Value::Str(s) = &k.value {
                out.insert(s.clone(), v);
            }
        }
        out
    }
}

/// The `__build_class__` builtin (spec.md §4.4): execute the class-body
/// function to get a namespace dict, then build the class from it.
pub fn build_class(
    vm: &VirtualMachine,
    body_result: PyDict,
    name: &str,
    bases: Vec<PyObjectRef>,
    metaclass: Option<PyObjectRef>,
) -> PyResult<PyObjectRef> {
    new_class(vm, name, bases, body_result.to_attributes(), metaclass)
}

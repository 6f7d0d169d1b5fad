//! Insertion-ordered, hash-keyed `Dict` and `Set`/`FrozenSet` storage.
//!
//! Grounded directly on the teacher's `dictdatatype.rs`: a hash-index table
//! mapping a precomputed hash to a bucket of entry positions, layered over
//! a dense `Vec` that preserves insertion order and leaves tombstones
//! behind on deletion (the "compact dict" design the teacher cites from
//! the morepypy write-up). We adapt `PyRwLock` → plain field access since
//! the owning `Value::Dict`/`Value::Set` already carries the `RefCell`
//! (the VM is single-threaded, spec.md §5/§9).
//!
//! Hashing and equality of *keys* are themselves Python-level operations
//! (a key's `__hash__`/`__eq__` may be user-defined), so every lookup takes
//! `&VirtualMachine` and threads `PyResult` through.

use crate::protocol::equality::{value_eq, value_hash};
use crate::value::PyObjectRef;
use crate::vm::{PyResult, VirtualMachine};

struct Entry {
    hash: i64,
    key: PyObjectRef,
    value: PyObjectRef,
}

/// Insertion-ordered mapping `Value -> Value`.
#[derive(Default)]
pub struct PyDict {
    /// hash -> candidate entry positions (collision chain, insertion order
    /// within the chain so the first match by probing is deterministic).
    indices: std::collections::HashMap<i64, Vec<usize>>,
    entries: Vec<Option<Entry>>,
    used: usize,
}

impl PyDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn find_slot(
        &self,
        vm: &VirtualMachine,
        hash: i64,
        key: &PyObjectRef,
    ) -> PyResult<Option<usize>> {
        if let Some(bucket) = self.indices.get(&hash) {
            for &pos in bucket {
                if let Some(entry) = &self.entries[pos] {
                    if value_eq(vm, &entry.key, key)? {
                        return Ok(Some(pos));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Insert `key -> value`, returning the previous value if `key` was
    /// already present.
    pub fn insert(
        &mut self,
        vm: &VirtualMachine,
        key: PyObjectRef,
        value: PyObjectRef,
    ) -> PyResult<Option<PyObjectRef>> {
        let hash = value_hash(vm, &key)?;
        if let Some(pos) = self.find_slot(vm, hash, &key)? {
            let entry = self.entries[pos].as_mut().unwrap();
            return Ok(Some(std::mem::replace(&mut entry.value, value)));
        }
        let pos = self.entries.len();
        self.entries.push(Some(Entry { hash, key, value }));
        self.indices.entry(hash).or_default().push(pos);
        self.used += 1;
        Ok(None)
    }

    pub fn get(&self, vm: &VirtualMachine, key: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
        let hash = value_hash(vm, key)?;
        Ok(self
            .find_slot(vm, hash, key)?
            .and_then(|pos| self.entries[pos].as_ref().map(|e| e.value.clone())))
    }

    pub fn contains(&self, vm: &VirtualMachine, key: &PyObjectRef) -> PyResult<bool> {
        Ok(self.get(vm, key)?.is_some())
    }

    pub fn remove(&mut self, vm: &VirtualMachine, key: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
        let hash = value_hash(vm, key)?;
        if let Some(pos) = self.find_slot(vm, hash, key)? {
            let entry = self.entries[pos].take().unwrap();
            if let Some(bucket) = self.indices.get_mut(&hash) {
                bucket.retain(|&p| p != pos);
            }
            self.used -= 1;
            return Ok(Some(entry.value));
        }
        Ok(None)
    }

    /// Iterate live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (PyObjectRef, PyObjectRef)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref())
            .map(|e| (e.key.clone(), e.value.clone()))
    }

    pub fn keys(&self) -> impl Iterator<Item = PyObjectRef> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = PyObjectRef> + '_ {
        self.iter().map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.indices.clear();
        self.entries.clear();
        self.used = 0;
    }

    /// Iterate live entries together with their precomputed hash, so a
    /// caller can copy entries into a fresh dict without re-hashing (no
    /// `&VirtualMachine` needed, no risk of a different `__hash__` result
    /// than when the entry was first inserted).
    pub(crate) fn iter_with_hash(&self) -> impl Iterator<Item = (i64, PyObjectRef, PyObjectRef)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref())
            .map(|e| (e.hash, e.key.clone(), e.value.clone()))
    }

    /// Insert with an explicit precomputed hash (no `value_hash` call, no
    /// `__eq__` dispatch for collision resolution — caller guarantees `key`
    /// is not already present, which holds when copying from another
    /// dict's distinct entries).
    pub(crate) fn insert_with_hash(&mut self, hash: i64, key: PyObjectRef, value: PyObjectRef) {
        let pos = self.entries.len();
        self.entries.push(Some(Entry { hash, key, value }));
        self.indices.entry(hash).or_default().push(pos);
        self.used += 1;
    }

    /// Update `self` with the entries of `other`, later keys winning, used
    /// by `**` unpacking in calls/literals and `dict.update`.
    pub fn update(&mut self, vm: &VirtualMachine, other: &PyDict) -> PyResult<()> {
        for (k, v) in other.iter() {
            self.insert(vm, k, v)?;
        }
        Ok(())
    }
}

/// `Set`/`FrozenSet` storage: the same hash-indexed table with unit values.
#[derive(Default)]
pub struct PySet {
    table: PyDict,
}

impl PySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn add(&mut self, vm: &VirtualMachine, item: PyObjectRef) -> PyResult<bool> {
        let existed = self.table.contains(vm, &item)?;
        self.table.insert(vm, item.clone(), item)?;
        Ok(!existed)
    }

    pub fn contains(&self, vm: &VirtualMachine, item: &PyObjectRef) -> PyResult<bool> {
        self.table.contains(vm, item)
    }

    pub fn remove(&mut self, vm: &VirtualMachine, item: &PyObjectRef) -> PyResult<bool> {
        Ok(self.table.remove(vm, item)?.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = PyObjectRef> + '_ {
        self.table.keys()
    }

    pub fn union(&self, vm: &VirtualMachine, other: &PySet) -> PyResult<PySet> {
        let mut out = PySet::new();
        for item in self.iter() {
            out.add(vm, item)?;
        }
        for item in other.iter() {
            out.add(vm, item)?;
        }
        Ok(out)
    }

    pub fn intersection(&self, vm: &VirtualMachine, other: &PySet) -> PyResult<PySet> {
        let mut out = PySet::new();
        for item in self.iter() {
            if other.contains(vm, &item)? {
                out.add(vm, item)?;
            }
        }
        Ok(out)
    }

    pub fn difference(&self, vm: &VirtualMachine, other: &PySet) -> PyResult<PySet> {
        let mut out = PySet::new();
        for item in self.iter() {
            if !other.contains(vm, &item)? {
                out.add(vm, item)?;
            }
        }
        Ok(out)
    }

    pub fn symmetric_difference(&self, vm: &VirtualMachine, other: &PySet) -> PyResult<PySet> {
        let mut out = PySet::new();
        for item in self.iter() {
            if !other.contains(vm, &item)? {
                out.add(vm, item)?;
            }
        }
        for item in other.iter() {
            if !self.contains(vm, &item)? {
                out.add(vm, item)?;
            }
        }
        Ok(out)
    }
}

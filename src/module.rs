//! Modules: a name plus a mutable attribute dict.
//!
//! Grounded on the teacher's `vm/builtins/module.rs` (`PyModule` as a thin
//! wrapper around its namespace dict). Actual import resolution —
//! locating and compiling source for a dotted name — is an embedder
//! responsibility (spec.md §1 Non-goals); this module only holds the
//! result.

use crate::dict::PyDict;
use std::cell::RefCell;
use std::rc::Rc;

pub struct PyModule {
    pub name: Rc<str>,
    pub dict: RefCell<PyDict>,
}

impl PyModule {
    pub fn new(name: Rc<str>) -> Self {
        PyModule {
            name,
            dict: RefCell::new(PyDict::new()),
        }
    }
}

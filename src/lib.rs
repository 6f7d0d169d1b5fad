//! A bytecode interpreter core for a dynamically typed, object-oriented
//! language: value model, object protocol, frame dispatch loop, and
//! suspendable generators/coroutines.
//!
//! Module layout mirrors the teacher's top-level split (`vm/vm.rs`,
//! `vm/frame.rs`, `vm/protocol/`, `bytecode/`) rather than the teacher's
//! full workspace-of-crates shape, since this crate has no compiler,
//! stdlib, or CLI front end to split out into siblings.

pub mod builtins_core;
pub mod bytecode;
pub mod class;
pub mod dict;
pub mod error;
pub mod exceptions;
pub mod frame;
pub mod function;
pub mod generator;
pub mod iterator;
pub mod module;
pub mod protocol;
pub mod value;
pub mod vm;

pub use error::VmInternalError;
pub use value::{PyObject, PyObjectRef, Value};
pub use vm::{PyResult, VirtualMachine, VmSettings};

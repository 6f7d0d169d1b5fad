//! Object-protocol operations: attribute access, calls, operators,
//! comparisons, containment, and value equality/hashing.
//!
//! Split into one module per protocol the way the teacher's
//! `vm/protocol/` does (`protocol/object.rs`, `protocol/sequence.rs`,
//! `protocol/mapping.rs`), rather than one monolithic `ops.rs`.

pub mod attr;
pub mod call;
pub mod compare;
pub mod equality;
pub mod operator;

//! Internal invariant violations: bugs in this crate's own bytecode
//! dispatch (operand-stack underflow, a block popped that doesn't match
//! the unwind reason, a fast-local slot read before assignment by
//! malformed bytecode) rather than anything a user's Python-level code
//! can trigger.
//!
//! Grounded on the teacher's `compiler.rs::CompileErrorType` (a
//! `thiserror`-derived enum for its own non-`PyBaseException` error
//! channel) and on its pervasive `debug_assert!`/`unreachable!` use for
//! compiler-trusted invariants elsewhere in `vm/frame.rs`.
//!
//! These conditions are raised with `std::panic::panic_any` carrying the
//! typed `VmInternalError` value (not a string-payload `panic!`). The
//! public entry points in `vm.rs` (`run_code`/`call`/`send`/`throw`/
//! `close`) catch that unwind at the embedding boundary
//! (`vm.rs::catch_internal_errors`) and convert it into an ordinary
//! `RuntimeError` exception object, so a compiler bug in this crate
//! never takes an embedder's process down with it and embedders only
//! ever have to handle the one `PyResult` error channel — without
//! threading a second error type through every opcode handler.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmInternalError {
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("block stack underflow")]
    BlockStackUnderflow,
    #[error("fast-local slot {0} read before assignment")]
    LocalSlotUnset(u32),
    /// Caught an unwind whose payload wasn't one of the variants above —
    /// still a bug in this crate, just not one of the named invariants.
    #[error("internal VM invariant violation")]
    Other,
}

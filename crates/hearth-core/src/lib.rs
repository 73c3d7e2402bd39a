//! Hearth VM core runtime
//!
//! This crate provides the virtual machine runtime for verbs attached to
//! database objects in a shared, persistent world:
//! - Bytecode interpreter over one task's call stack
//! - Structured exception handling and forced-abort unwinding
//! - Native-function call protocol (multi-step, suspendable)
//! - Whole-VM suspend/resume snapshots with durable text persistence
//! - Cooperative per-player task-queue scheduler
//!
//! The object database, the compiler, and the command parser are external
//! collaborators reached through the traits in [`db`] and [`host`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod activation;
pub mod db;
pub mod host;
pub mod persist;
pub mod scheduler;
pub mod testing;
pub mod var;
pub mod vm;

pub use activation::Activation;
pub use db::{VerbInfo, WorldState};
pub use host::{Host, VerbCall};
pub use scheduler::{Scheduler, SchedulerClient, SchedulerOptions, TaskId};
pub use var::{ErrCode, List, Map, ObjId, Value};
pub use vm::{
    AbortReason, ExecCtx, Exception, Interp, NativeOutcome, NativeRegistry, ResumeValue, Snapshot,
    TaskOutcome, Vm, WakeCondition,
};

/// VM execution errors
///
/// These are process-level failures (malformed bytecode, broken invariants),
/// not language errors; a verb can never catch one. Language errors travel as
/// [`var::ErrCode`] through the unwind engine instead.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Operand stack exceeded the vector's declared bound
    #[error("Operand stack overflow")]
    StackOverflow,

    /// Operand pop from an empty stack
    #[error("Operand stack underflow")]
    StackUnderflow,

    /// Undecodable instruction byte
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Instruction stream ended inside an instruction
    #[error("Truncated bytecode at pc {0}")]
    TruncatedBytecode(usize),

    /// A structural invariant did not hold
    #[error("Corrupt execution state: {0}")]
    Corrupt(String),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;

//! Hearth VM compiled-verb artifact
//!
//! This crate defines the artifact the external compiler hands to the VM:
//! - Single-byte [`Opcode`]s with inline operands
//! - The immutable [`Program`] (main + fork vectors, literals, variable names)
//! - A two-pass [`ProgramBuilder`] assembler
//! - The line-oriented text codec shared with VM persistence

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod opcode;
pub mod program;
pub mod text;

pub use builder::{Label, ProgramBuilder};
pub use opcode::Opcode;
pub use program::{vars, Literal, Program, Vector, VectorId, PROGRAM_VERSION};
pub use text::{DecodeError, LineReader};

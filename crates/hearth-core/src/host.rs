//! Host environment interface
//!
//! Everything outside the VM and the object database: player connections,
//! command parsing, and the in-database uncaught-error handler. The scheduler
//! and interpreter only ever talk to these through this trait.

use crate::var::{List, ObjId};
use crate::vm::Exception;

/// A parsed command ready for verb dispatch
#[derive(Debug, Clone)]
pub struct VerbCall {
    /// Object the verb will be invoked on
    pub this: ObjId,
    /// Verb name as matched
    pub verb: String,
    /// Parsed argument words
    pub args: List,
    /// The raw argument string
    pub argstr: String,
    /// Direct object match
    pub dobj: ObjId,
    /// Indirect object match
    pub iobj: ObjId,
}

/// The host environment around the VM
pub trait Host {
    /// Deliver one line of output to a player's connection
    fn notify(&mut self, player: ObjId, line: &str);

    /// Hand an uncaught exception and its stack trace to the designated
    /// in-database handler. Failures here must not propagate; the task is
    /// already lost.
    fn handle_uncaught(&mut self, player: ObjId, exception: &Exception, traceback: &List);

    /// Parse one input line into a verb dispatch, or handle it internally
    /// and return `None`
    fn parse_command(&mut self, player: ObjId, line: &str) -> Option<VerbCall>;

    /// Pause or resume upstream input delivery for a player whose queue
    /// crossed a watermark
    fn set_input_flow(&mut self, player: ObjId, paused: bool);
}

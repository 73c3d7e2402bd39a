//! Suspension and resumption
//!
//! A [`Snapshot`] owns everything a parked task needs to continue later,
//! possibly in another process: every activation in order, the recursion
//! bound, the start vector, and the task-local value. Capture transfers
//! ownership out of the running [`Vm`] rather than copying, so nothing is
//! freed twice; the abandoned VM is left empty.

use super::native::NativeRegistry;
use super::unwind::Exception;
use super::Vm;
use crate::activation::Activation;
use crate::var::{v_str, ErrCode, List, Map, Value};
use hearth_bytecode::VectorId;

/// What a resumed task receives at its suspension point
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeValue {
    /// Deliver a value, as if the suspending native had returned it
    Push(Value),
    /// Raise an error at the suspension point
    Raise(Exception),
}

/// A captured VM, independently owned and durable
#[derive(Debug)]
pub struct Snapshot {
    /// Activations, bottom first
    pub frames: Vec<Activation>,
    /// Recursion limit
    pub max_depth: usize,
    /// Which vector the bottom frame runs
    pub start_vector: VectorId,
    /// Task-local storage
    pub task_local: Value,
}

impl Snapshot {
    /// Take ownership of a running VM's entire state
    ///
    /// The VM is left frameless; it must not be executed again.
    pub fn capture(vm: &mut Vm) -> Self {
        Self {
            frames: std::mem::take(&mut vm.frames),
            max_depth: vm.max_depth,
            start_vector: vm.start_vector,
            task_local: std::mem::replace(&mut vm.task_local, Value::Map(Map::new())),
        }
    }

    /// Rebuild a runnable VM
    pub fn reconstitute(self) -> Vm {
        Vm {
            frames: self.frames,
            max_depth: self.max_depth,
            start_vector: self.start_vector,
            task_local: self.task_local,
        }
    }

    /// Validate and rehydrate native continuation state after a load from
    /// durable storage
    ///
    /// A native frame whose function is no longer registered, or whose
    /// revive hook rejects its data, fails the whole resumption; the task
    /// is discarded rather than run with corrupt state.
    pub fn revive(&mut self, natives: &NativeRegistry) -> Result<(), ErrCode> {
        for frame in &mut self.frames {
            if let Some(native) = &mut frame.native {
                if !natives.contains(native.id) {
                    return Err(ErrCode::E_INVARG);
                }
                native.data = natives.revive(native.id, &native.data)?;
            }
        }
        Ok(())
    }

    /// One entry per frame for task introspection, innermost first
    pub fn stack_listing(&self) -> List {
        let mut entries = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            entries.push(crate::var::v_list(vec![
                frame.this.clone(),
                v_str(&frame.verb_name),
                Value::Obj(frame.definer),
                Value::Int(frame.line() as i64),
            ]));
        }
        List::from_vec(entries)
    }
}

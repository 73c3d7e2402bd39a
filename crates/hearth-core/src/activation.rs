//! Call frames
//!
//! One [`Activation`] is the full state of a single verb (or native) call:
//! its program and code vector, variable environment, bounded operand stack,
//! program counter, and the identity it executes under. Frames are plain
//! data; everything needed to persist and revive one is right here.

use crate::var::{List, ObjId, Value};
use crate::{VmError, VmResult};
use hearth_bytecode::{vars, Program, VectorId};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Continuation state for a frame that is mid-way through a native call
///
/// `data` is the native's own state between steps; it is a [`Value`] so that
/// it serializes with everything else.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeFrame {
    /// Registry id of the native function
    pub id: u16,
    /// Step counter; 1 on first entry, incremented per re-entry
    pub step: u8,
    /// Continuation data owned by the native
    pub data: Value,
}

/// Shared placeholder program for native continuation frames
static NATIVE_STUB: Lazy<Arc<Program>> = Lazy::new(|| Arc::new(Program::default()));

/// Placeholder program used by frames that have no verb body
pub fn native_stub_program() -> Arc<Program> {
    NATIVE_STUB.clone()
}

/// One call frame
#[derive(Debug, Clone)]
pub struct Activation {
    /// The compiled verb being executed
    pub program: Arc<Program>,
    /// Which code vector of the program this frame runs
    pub vector: VectorId,
    /// Next instruction offset
    pub pc: usize,
    /// Offset of the most recent fault, for source-line diagnostics
    pub error_pc: usize,
    /// Variable environment; `None` is an empty (unset) slot
    pub env: Vec<Option<Value>>,
    /// Operand stack, bounded by the vector's declared depth
    pub stack: Vec<Value>,
    /// Value the verb was invoked on
    pub this: Value,
    /// Player the task runs on behalf of
    pub player: ObjId,
    /// The calling frame's `this`
    pub caller: Value,
    /// Object the verb is defined on
    pub definer: ObjId,
    /// Principal whose authority the frame executes under
    pub permissions: ObjId,
    /// Verb name as invoked
    pub verb_name: String,
    /// All names of the verb definition
    pub verb_names: String,
    /// Catchable-error semantics; false squelches raises into error values
    pub debug: bool,
    /// Present when this frame is a native-call continuation
    pub native: Option<NativeFrame>,
}

impl Activation {
    /// Frame for a verb call
    #[allow(clippy::too_many_arguments)]
    pub fn for_call(
        program: Arc<Program>,
        this: Value,
        player: ObjId,
        caller: Value,
        definer: ObjId,
        permissions: ObjId,
        verb_name: &str,
        verb_names: &str,
        debug: bool,
        args: List,
        argstr: &str,
        dobj: ObjId,
        iobj: ObjId,
    ) -> Self {
        let mut env: Vec<Option<Value>> = vec![None; program.var_names.len()];
        set_builtin(&mut env, vars::PLAYER, Value::Obj(player));
        set_builtin(&mut env, vars::THIS, this.clone());
        set_builtin(&mut env, vars::CALLER, caller.clone());
        set_builtin(&mut env, vars::VERB, crate::var::v_str(verb_name));
        set_builtin(&mut env, vars::ARGS, Value::List(args));
        set_builtin(&mut env, vars::ARGSTR, crate::var::v_str(argstr));
        set_builtin(&mut env, vars::DOBJ, Value::Obj(dobj));
        set_builtin(&mut env, vars::IOBJ, Value::Obj(iobj));
        let max_stack = program.main.max_stack;
        Self {
            program,
            vector: VectorId::Main,
            pc: 0,
            error_pc: 0,
            env,
            stack: Vec::with_capacity(max_stack),
            this,
            player,
            caller,
            definer,
            permissions,
            verb_name: verb_name.to_string(),
            verb_names: verb_names.to_string(),
            debug,
            native: None,
        }
    }

    /// Frame for a forked vector: same identity, captured environment,
    /// fresh stack
    pub fn for_fork(parent: &Activation, fork_index: u16) -> Self {
        let vector = VectorId::Fork(fork_index);
        let max_stack = parent
            .program
            .vector(vector)
            .map(|v| v.max_stack)
            .unwrap_or(0);
        Self {
            program: parent.program.clone(),
            vector,
            pc: 0,
            error_pc: 0,
            env: parent.env.clone(),
            stack: Vec::with_capacity(max_stack),
            this: parent.this.clone(),
            player: parent.player,
            caller: parent.caller.clone(),
            definer: parent.definer,
            permissions: parent.permissions,
            verb_name: parent.verb_name.clone(),
            verb_names: parent.verb_names.clone(),
            debug: parent.debug,
            native: None,
        }
    }

    /// Synthetic frame recording an in-flight native call; `step` is the
    /// step the native will be re-entered with
    pub fn for_native(id: u16, name: &str, step: u8, data: Value, caller: &Activation) -> Self {
        Self {
            program: native_stub_program(),
            vector: VectorId::Main,
            pc: 0,
            error_pc: 0,
            env: Vec::new(),
            stack: Vec::new(),
            this: caller.this.clone(),
            player: caller.player,
            caller: caller.this.clone(),
            definer: ObjId::NOTHING,
            permissions: caller.permissions,
            verb_name: name.to_string(),
            verb_names: name.to_string(),
            debug: true,
            native: Some(NativeFrame { id, step, data }),
        }
    }

    /// Whether this frame is a native-call continuation
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// Declared operand bound for this frame's vector
    pub fn max_stack(&self) -> usize {
        self.program
            .vector(self.vector)
            .map(|v| v.max_stack)
            .unwrap_or(0)
    }

    // ===== Operand stack =====

    /// Push a value
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.max_stack() {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop a value
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Borrow the top value
    pub fn peek(&self) -> VmResult<&Value> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    /// Replace the value `depth` slots from the top (0 = top)
    pub fn poke(&mut self, depth: usize, value: Value) -> VmResult<()> {
        let len = self.stack.len();
        if depth >= len {
            return Err(VmError::StackUnderflow);
        }
        self.stack[len - 1 - depth] = value;
        Ok(())
    }

    /// Borrow the value `depth` slots from the top (0 = top)
    pub fn peek_at(&self, depth: usize) -> VmResult<&Value> {
        let len = self.stack.len();
        if depth >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(&self.stack[len - 1 - depth])
    }

    /// Discard down to a target depth
    pub fn truncate_stack(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    // ===== Environment =====

    /// Read a variable slot; `None` if the slot is empty or out of range
    pub fn get_var(&self, slot: u16) -> Option<&Value> {
        self.env.get(slot as usize).and_then(|v| v.as_ref())
    }

    /// Write a variable slot
    pub fn set_var(&mut self, slot: u16, value: Value) -> VmResult<()> {
        match self.env.get_mut(slot as usize) {
            Some(entry) => {
                *entry = Some(value);
                Ok(())
            }
            None => Err(VmError::Corrupt(format!(
                "variable slot {slot} out of range"
            ))),
        }
    }

    /// Variable name for diagnostics
    pub fn var_name(&self, slot: u16) -> &str {
        self.program.var_name(slot as usize).unwrap_or("?")
    }

    // ===== Control =====

    /// Transfer control to an absolute label
    pub fn jump(&mut self, label: u16) {
        self.pc = label as usize;
    }

    /// Source line of the most recent fault
    pub fn line(&self) -> usize {
        self.program
            .line_for(self.vector, self.error_pc)
            .unwrap_or(0)
    }
}

fn set_builtin(env: &mut [Option<Value>], slot: u16, value: Value) {
    if let Some(entry) = env.get_mut(slot as usize) {
        *entry = Some(value);
    }
}

//! The opcode dispatch loop
//!
//! [`Interp`] executes one task's [`Vm`] until it finishes, aborts, or
//! suspends. The inner loop (`execute_frame`) runs the top frame's bytecode
//! as a single flat match over the instruction byte; anything that leaves
//! the frame (a return, a raise, a verb or native call, a fork) is handed
//! back to the outer loop, which manages frame push/pop through the unwind
//! engine.
//!
//! Language errors respect the faulting frame's debug flag: debug frames
//! unwind, non-debug frames have the error code pushed where the result
//! would have gone and keep running.

use super::native::{NativeArgs, NativeOutcome, NativeRegistry, SchedulerOps};
use super::suspend::{ResumeValue, Snapshot};
use super::unwind::{self, Exception, UnwindOutcome, UnwindReason};
use super::{ExecCtx, SuspendRequest, TaskOutcome, Vm};
use crate::activation::Activation;
use crate::db::WorldState;
use crate::host::Host;
use crate::var::{
    v_bool, v_empty_list, v_empty_map, v_list, CatchCodes, CatchMarker, ErrCode, FinallyMarker,
    IterSeq, IterState, List, ObjId, Value,
};
use crate::{VmError, VmResult};
use hearth_bytecode::{vars, Opcode};
use std::time::Duration;
use tracing::trace;

/// What the inner dispatch loop handed back to the frame-management loop
enum FrameResult {
    /// An explicit or implicit return
    Return(Value),
    /// A raise in a debug frame
    Raise(Exception),
    /// A reason already in flight (exit, or a finally body finishing)
    Unwind(UnwindReason),
    /// A verb call to push; `pass` redirects resolution to the definer's
    /// parent while keeping `this`
    CallVerb {
        this: Value,
        verb: String,
        args: List,
        pass: bool,
    },
    /// A native-function call
    CallNative { id: u16, args: List },
    /// A fork request
    Fork { index: u16, delay: Duration },
}

/// The interpreter: executes one task at a time against its collaborators
pub struct Interp<'a> {
    world: &'a mut dyn WorldState,
    host: &'a mut dyn Host,
    natives: &'a NativeRegistry,
    sched: &'a mut dyn SchedulerOps,
    ctx: ExecCtx,
}

/// Deliver a language error inside the current frame: unwind in debug
/// frames, push the error value otherwise
fn frame_raise(
    frame: &mut Activation,
    code: ErrCode,
    msg: Option<String>,
) -> VmResult<Option<FrameResult>> {
    if frame.debug {
        let exc = match msg {
            Some(msg) => Exception::with_msg(code, msg),
            None => Exception::new(code),
        };
        Ok(Some(FrameResult::Raise(exc)))
    } else {
        frame.push(Value::Err(code))?;
        Ok(None)
    }
}

macro_rules! raise {
    ($frame:expr, $code:expr) => {
        if let Some(r) = frame_raise($frame, $code, None)? {
            return Ok(r);
        }
    };
    ($frame:expr, $code:expr, $msg:expr) => {
        if let Some(r) = frame_raise($frame, $code, Some($msg))? {
            return Ok(r);
        }
    };
}

// Binary operator: pop rhs, apply to lhs in place, replace with result.
// On error both operands are consumed and the error is delivered in place.
macro_rules! binary_op {
    ($frame:expr, $method:ident) => {{
        let rhs = $frame.pop()?;
        let lhs = $frame.peek()?;
        match lhs.$method(&rhs) {
            Ok(v) => $frame.poke(0, v)?,
            Err(code) => {
                $frame.pop()?;
                raise!($frame, code);
            }
        }
    }};
}

macro_rules! compare_op {
    ($frame:expr, $test:ident) => {{
        let rhs = $frame.pop()?;
        let lhs = $frame.peek()?;
        match lhs.compare(&rhs) {
            Ok(ord) => {
                let b = v_bool(ord.$test());
                $frame.poke(0, b)?;
            }
            Err(code) => {
                $frame.pop()?;
                raise!($frame, code);
            }
        }
    }};
}

impl<'a> Interp<'a> {
    /// Assemble an interpreter around its collaborators and a budget
    pub fn new(
        world: &'a mut dyn WorldState,
        host: &'a mut dyn Host,
        natives: &'a NativeRegistry,
        sched: &'a mut dyn SchedulerOps,
        ctx: ExecCtx,
    ) -> Self {
        Self {
            world,
            host,
            natives,
            sched,
            ctx,
        }
    }

    /// Remaining budget, for callers that account usage
    pub fn ctx(&self) -> &ExecCtx {
        &self.ctx
    }

    /// Run a VM to its terminal outcome
    pub fn run(&mut self, vm: Vm) -> VmResult<TaskOutcome> {
        self.run_inner(vm, None)
    }

    /// Reconstitute a snapshot, deliver the resumption, and continue
    pub fn resume(&mut self, snapshot: Snapshot, value: ResumeValue) -> VmResult<TaskOutcome> {
        let vm = snapshot.reconstitute();
        self.run_inner(vm, Some(value))
    }

    fn run_inner(&mut self, mut vm: Vm, entry: Option<ResumeValue>) -> VmResult<TaskOutcome> {
        match entry {
            Some(ResumeValue::Push(value)) => {
                if vm.top().is_native() {
                    if let Some(outcome) = self.reenter_native(&mut vm, value)? {
                        return Ok(outcome);
                    }
                } else {
                    vm.top_mut().push(value)?;
                }
            }
            Some(ResumeValue::Raise(exc)) => {
                let reason = unwind::raise(&vm, exc);
                if let Some(outcome) = self.apply_unwind(&mut vm, reason)? {
                    return Ok(outcome);
                }
            }
            None => {}
        }

        loop {
            let result = self.execute_frame(&mut vm)?;
            let outcome = match result {
                FrameResult::Return(value) => {
                    self.apply_unwind(&mut vm, UnwindReason::Return(value))?
                }
                FrameResult::Raise(exc) => {
                    let reason = unwind::raise(&vm, exc);
                    self.apply_unwind(&mut vm, reason)?
                }
                FrameResult::Unwind(reason) => self.apply_unwind(&mut vm, reason)?,
                FrameResult::CallVerb {
                    this,
                    verb,
                    args,
                    pass,
                } => self.call_verb(&mut vm, this, &verb, args, pass)?,
                FrameResult::CallNative { id, args } => {
                    if let Err(code) = self.natives.check_arity(id, args.len()) {
                        self.raise_code(&mut vm, code)?
                    } else {
                        self.dispatch_native(&mut vm, id, 1, Value::Int(0), args, false)?
                    }
                }
                FrameResult::Fork { index, delay } => {
                    let forked = Activation::for_fork(vm.top(), index);
                    match self.sched.fork_task(forked, delay) {
                        Ok(id) => {
                            trace!(task = id.as_u64(), "forked");
                            None
                        }
                        Err(code) => self.raise_code(&mut vm, code)?,
                    }
                }
            };
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }
    }

    /// Route a reason through the unwind engine and translate the result
    fn apply_unwind(
        &mut self,
        vm: &mut Vm,
        reason: UnwindReason,
    ) -> VmResult<Option<TaskOutcome>> {
        match unwind::unwind(vm, reason, self.host, self.natives)? {
            UnwindOutcome::Resumed => Ok(None),
            UnwindOutcome::ReenterNative(value) => self.reenter_native(vm, value),
            UnwindOutcome::Done(value) => Ok(Some(TaskOutcome::Done(value))),
            UnwindOutcome::Aborted(reason) => Ok(Some(TaskOutcome::Aborted(reason))),
        }
    }

    /// Deliver a language error at the current top frame
    fn raise_code(&mut self, vm: &mut Vm, code: ErrCode) -> VmResult<Option<TaskOutcome>> {
        if vm.top().debug {
            let reason = unwind::raise(vm, Exception::new(code));
            self.apply_unwind(vm, reason)
        } else {
            vm.top_mut().push(Value::Err(code))?;
            Ok(None)
        }
    }

    /// Resolve and push a verb-call frame
    fn call_verb(
        &mut self,
        vm: &mut Vm,
        this: Value,
        verb: &str,
        args: List,
        pass: bool,
    ) -> VmResult<Option<TaskOutcome>> {
        if vm.depth() >= vm.max_depth {
            return self.raise_code(vm, ErrCode::E_MAXREC);
        }
        let frame = vm.top();
        let target = if pass {
            match self.world.parent(frame.definer) {
                Ok(parent) if parent != ObjId::NOTHING => parent,
                Ok(_) => return self.raise_code(vm, ErrCode::E_VERBNF),
                Err(code) => return self.raise_code(vm, code),
            }
        } else {
            match &this {
                Value::Obj(obj) => *obj,
                _ => return self.raise_code(vm, ErrCode::E_INVIND),
            }
        };
        let info = match self.world.find_verb(frame.permissions, target, verb) {
            Ok(info) => info,
            Err(code) => return self.raise_code(vm, code),
        };

        // Command-context variables carry through verb calls.
        let argstr = match frame.get_var(vars::ARGSTR) {
            Some(Value::Str(s)) => s.to_string(),
            _ => String::new(),
        };
        let dobj = match frame.get_var(vars::DOBJ) {
            Some(Value::Obj(o)) => *o,
            _ => ObjId::NOTHING,
        };
        let iobj = match frame.get_var(vars::IOBJ) {
            Some(Value::Obj(o)) => *o,
            _ => ObjId::NOTHING,
        };

        let callee = Activation::for_call(
            info.program.clone(),
            this,
            frame.player,
            frame.this.clone(),
            info.definer,
            info.owner,
            verb,
            &info.names,
            info.debug,
            args,
            &argstr,
            dobj,
            iobj,
        );
        vm.frames.push(callee);
        Ok(None)
    }

    /// Re-enter the native continuation frame at the top of the stack
    fn reenter_native(&mut self, vm: &mut Vm, value: Value) -> VmResult<Option<TaskOutcome>> {
        let top = vm.top();
        let native = top
            .native
            .clone()
            .ok_or_else(|| VmError::Corrupt("re-entry target is not a native frame".into()))?;
        self.dispatch_native(
            vm,
            native.id,
            native.step,
            native.data,
            List::from_vec(vec![value]),
            true,
        )
    }

    /// Invoke a native function and apply its outcome
    ///
    /// `reentry` distinguishes a fresh `CallNative` (no continuation frame
    /// exists yet) from a re-entry (the top frame is the continuation).
    fn dispatch_native(
        &mut self,
        vm: &mut Vm,
        id: u16,
        step: u8,
        data: Value,
        args: List,
        reentry: bool,
    ) -> VmResult<Option<TaskOutcome>> {
        let def = self
            .natives
            .def(id)
            .ok_or_else(|| VmError::Corrupt(format!("native id {id} not registered")))?;
        let func = def.func;
        let name = def.name.clone();

        let (player, permissions) = {
            let frame = vm.top();
            (frame.player, frame.permissions)
        };
        let outcome = {
            let mut a = NativeArgs {
                args,
                step,
                data,
                player,
                permissions,
                task_local: &mut vm.task_local,
                world: &mut *self.world,
                host: &mut *self.host,
                sched: &mut *self.sched,
                ctx: &self.ctx,
            };
            func(&mut a)
        };

        match outcome {
            NativeOutcome::Ret(value) => {
                if reentry {
                    // The continuation frame is done; deliver like a return.
                    self.apply_unwind(vm, UnwindReason::Return(value))
                } else {
                    vm.top_mut().push(value)?;
                    Ok(None)
                }
            }
            NativeOutcome::Raise(exc) => {
                // The native appears in the trace as a synthetic frame. On a
                // fresh call no frame exists yet, so park one for capture.
                if !reentry {
                    let synthetic = Activation::for_native(id, &name, 1, Value::Int(0), vm.top());
                    vm.frames.push(synthetic);
                }
                let reason = unwind::raise(vm, exc);
                // The native finished by raising; its frame and data are
                // spent, no cleanup hook.
                vm.frames.pop();
                let UnwindReason::Raise {
                    exception,
                    traceback,
                } = reason
                else {
                    unreachable!("raise constructor returned a non-raise reason");
                };
                if vm.top().debug {
                    self.apply_unwind(
                        vm,
                        UnwindReason::Raise {
                            exception,
                            traceback,
                        },
                    )
                } else {
                    vm.top_mut().push(Value::Err(exception.code))?;
                    Ok(None)
                }
            }
            NativeOutcome::Call {
                this,
                verb,
                args,
                data,
            } => {
                if reentry {
                    let frame = vm.top_mut();
                    let native = frame.native.as_mut().expect("reentry frame is native");
                    native.step += 1;
                    native.data = data;
                } else {
                    let cont = Activation::for_native(id, &name, 2, data, vm.top());
                    vm.frames.push(cont);
                }
                // A resolution failure raises through the continuation frame,
                // which tears it down with its cleanup hook.
                self.call_verb(vm, Value::Obj(this), &verb, args, false)
            }
            NativeOutcome::TailCall { this, verb, args } => {
                if reentry {
                    // No continuation left; the callee returns to my caller.
                    vm.frames.pop();
                }
                self.call_verb(vm, Value::Obj(this), &verb, args, false)
            }
            NativeOutcome::Suspend { wake, data } => {
                if reentry {
                    let frame = vm.top_mut();
                    let native = frame.native.as_mut().expect("reentry frame is native");
                    native.step += 1;
                    native.data = data;
                } else {
                    let cont = Activation::for_native(id, &name, 2, data, vm.top());
                    vm.frames.push(cont);
                }
                let snapshot = Snapshot::capture(vm);
                Ok(Some(TaskOutcome::Suspended(Box::new(SuspendRequest {
                    snapshot,
                    wake,
                }))))
            }
            NativeOutcome::Kill(reason) => self.apply_unwind(vm, UnwindReason::Abort(reason)),
        }
    }

    /// Execute the top frame's bytecode until something leaves the frame
    fn execute_frame(&mut self, vm: &mut Vm) -> VmResult<FrameResult> {
        let frame = vm
            .frames
            .last_mut()
            .ok_or_else(|| VmError::Corrupt("execute on empty call stack".into()))?;
        if frame.is_native() {
            return Err(VmError::Corrupt(
                "native continuation frame reached the dispatch loop".into(),
            ));
        }
        let program = frame.program.clone();
        let vector = program
            .vector(frame.vector)
            .ok_or_else(|| VmError::Corrupt("frame vector missing from program".into()))?;
        let code = &vector.code;

        loop {
            if let Some(abort) = self.ctx.tick() {
                return Ok(FrameResult::Unwind(UnwindReason::Abort(abort)));
            }
            if frame.pc >= code.len() {
                return Err(VmError::TruncatedBytecode(frame.pc));
            }
            frame.error_pc = frame.pc;
            let byte = code[frame.pc];
            frame.pc += 1;
            let op = Opcode::from_u8(byte).ok_or(VmError::InvalidOpcode(byte))?;

            match op {
                Opcode::Nop => {}
                Opcode::Pop => {
                    frame.pop()?;
                }

                // ===== Immediates =====
                Opcode::ImmInt8 => {
                    let v = read_u8(code, &mut frame.pc)? as i8;
                    frame.push(Value::Int(v as i64))?;
                }
                Opcode::ImmInt => {
                    let v = read_i64(code, &mut frame.pc)?;
                    frame.push(Value::Int(v))?;
                }
                Opcode::ImmFloat => {
                    let v = read_f64(code, &mut frame.pc)?;
                    frame.push(Value::Float(v))?;
                }
                Opcode::ImmErr => {
                    let byte = read_u8(code, &mut frame.pc)?;
                    let code_val = ErrCode::from_u8(byte)
                        .ok_or_else(|| VmError::Corrupt(format!("bad error literal {byte}")))?;
                    frame.push(Value::Err(code_val))?;
                }
                Opcode::Imm => {
                    let index = read_u16(code, &mut frame.pc)? as usize;
                    let literal = program
                        .literal(index)
                        .ok_or_else(|| VmError::Corrupt(format!("literal {index} out of range")))?;
                    frame.push(Value::from_literal(literal))?;
                }
                Opcode::ImmEmptyList => frame.push(v_empty_list())?,
                Opcode::MakeSingletonList => {
                    let v = frame.peek()?.clone();
                    frame.poke(0, v_list(vec![v]))?;
                }
                Opcode::ListAddTail => {
                    let tail = frame.pop()?;
                    match frame.peek()? {
                        Value::List(list) => {
                            let mut list = list.clone();
                            list.push(tail);
                            frame.poke(0, Value::List(list))?;
                        }
                        _ => {
                            frame.pop()?;
                            raise!(frame, ErrCode::E_TYPE);
                        }
                    }
                }
                Opcode::ListAppend => {
                    let tail = frame.pop()?;
                    match (frame.peek()?, &tail) {
                        (Value::List(list), Value::List(tail)) => {
                            let mut list = list.clone();
                            list.append(tail);
                            frame.poke(0, Value::List(list))?;
                        }
                        _ => {
                            frame.pop()?;
                            raise!(frame, ErrCode::E_TYPE);
                        }
                    }
                }
                Opcode::MakeMap => frame.push(v_empty_map())?,
                Opcode::MapInsert => {
                    let value = frame.pop()?;
                    let key = frame.pop()?;
                    match frame.peek()? {
                        Value::Map(map) => {
                            let mut map = map.clone();
                            match map.insert(key, value) {
                                Ok(()) => frame.poke(0, Value::Map(map))?,
                                Err(code) => {
                                    frame.pop()?;
                                    raise!(frame, code);
                                }
                            }
                        }
                        _ => {
                            frame.pop()?;
                            raise!(frame, ErrCode::E_TYPE);
                        }
                    }
                }
                Opcode::CheckListForSplice => {
                    if !matches!(frame.peek()?, Value::List(_)) {
                        frame.pop()?;
                        raise!(frame, ErrCode::E_TYPE);
                    }
                }

                // ===== Variables =====
                Opcode::Push => {
                    let slot = read_u16(code, &mut frame.pc)?;
                    match frame.get_var(slot) {
                        Some(v) => {
                            let v = v.clone();
                            frame.push(v)?;
                        }
                        None => {
                            let name = frame.var_name(slot).to_string();
                            raise!(
                                frame,
                                ErrCode::E_VARNF,
                                format!("Variable `{name}` not found")
                            );
                        }
                    }
                }
                Opcode::Put => {
                    let slot = read_u16(code, &mut frame.pc)?;
                    let v = frame.peek()?.clone();
                    frame.set_var(slot, v)?;
                }

                // ===== Operators =====
                Opcode::Add => binary_op!(frame, add),
                Opcode::Sub => binary_op!(frame, sub),
                Opcode::Mul => binary_op!(frame, mul),
                Opcode::Div => binary_op!(frame, div),
                Opcode::Mod => binary_op!(frame, rem),
                Opcode::Pow => binary_op!(frame, pow),
                Opcode::Neg => {
                    let v = frame.peek()?;
                    match v.neg() {
                        Ok(v) => frame.poke(0, v)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::Not => {
                    let v = !frame.peek()?.is_true();
                    frame.poke(0, v_bool(v))?;
                }
                Opcode::Eq => {
                    let rhs = frame.pop()?;
                    let eq = *frame.peek()? == rhs;
                    frame.poke(0, v_bool(eq))?;
                }
                Opcode::Ne => {
                    let rhs = frame.pop()?;
                    let ne = *frame.peek()? != rhs;
                    frame.poke(0, v_bool(ne))?;
                }
                Opcode::Lt => compare_op!(frame, is_lt),
                Opcode::Le => compare_op!(frame, is_le),
                Opcode::Gt => compare_op!(frame, is_gt),
                Opcode::Ge => compare_op!(frame, is_ge),
                Opcode::In => {
                    let rhs = frame.pop()?;
                    let lhs = frame.peek()?;
                    match lhs.index_in(&rhs) {
                        Ok(v) => frame.poke(0, v)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::And => {
                    let label = read_u16(code, &mut frame.pc)?;
                    if !frame.peek()?.is_true() {
                        frame.jump(label);
                    } else {
                        frame.pop()?;
                    }
                }
                Opcode::Or => {
                    let label = read_u16(code, &mut frame.pc)?;
                    if frame.peek()?.is_true() {
                        frame.jump(label);
                    } else {
                        frame.pop()?;
                    }
                }

                // ===== Indexing =====
                Opcode::Index => {
                    let index = frame.pop()?;
                    match frame.peek()?.index(&index) {
                        Ok(v) => frame.poke(0, v)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::IndexSet => {
                    let value = frame.pop()?;
                    let index = frame.pop()?;
                    match frame.peek()?.index_set(&index, value) {
                        Ok(v) => frame.poke(0, v)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::RangeIdx => {
                    let to = frame.pop()?;
                    let from = frame.pop()?;
                    match frame.peek()?.range(&from, &to) {
                        Ok(v) => frame.poke(0, v)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::RangeSet => {
                    let value = frame.pop()?;
                    let to = frame.pop()?;
                    let from = frame.pop()?;
                    match frame.peek()?.range_set(&from, &to, &value) {
                        Ok(v) => frame.poke(0, v)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::Length => {
                    let offset = read_u16(code, &mut frame.pc)? as usize;
                    let v = frame
                        .stack
                        .get(offset)
                        .ok_or(VmError::StackUnderflow)?
                        .clone();
                    match v.length() {
                        Ok(v) => frame.push(v)?,
                        Err(code) => raise!(frame, code),
                    }
                }

                // ===== Control flow =====
                Opcode::Jump => {
                    let label = read_u16(code, &mut frame.pc)?;
                    frame.jump(label);
                }
                Opcode::IfFalse => {
                    let label = read_u16(code, &mut frame.pc)?;
                    if !frame.pop()?.is_true() {
                        frame.jump(label);
                    }
                }
                Opcode::BeginForList => {
                    let end = read_u16(code, &mut frame.pc)?;
                    let seq = frame.pop()?;
                    let seq = match seq {
                        Value::List(l) => IterSeq::List(l),
                        Value::Map(m) => IterSeq::Map(m),
                        _ => {
                            frame.jump(end);
                            raise!(
                                frame,
                                ErrCode::E_TYPE,
                                "invalid sequence type in for loop".to_string()
                            );
                            continue;
                        }
                    };
                    frame.push(Value::Iter(Box::new(IterState { seq, pos: 0 })))?;
                }
                Opcode::IterForList => {
                    let value_var = read_u16(code, &mut frame.pc)?;
                    let key_var = read_u16(code, &mut frame.pc)?;
                    let end = read_u16(code, &mut frame.pc)?;
                    let cursor = frame.pop()?;
                    let Value::Iter(mut state) = cursor else {
                        return Err(VmError::Corrupt(
                            "loop step without an iteration cursor".into(),
                        ));
                    };
                    match state.next() {
                        None => frame.jump(end),
                        Some((key, value)) => {
                            frame.push(Value::Iter(state))?;
                            frame.set_var(value_var, value)?;
                            if key_var != u16::MAX {
                                frame.set_var(key_var, key)?;
                            }
                        }
                    }
                }
                Opcode::IterForRange => {
                    let var = read_u16(code, &mut frame.pc)?;
                    let end = read_u16(code, &mut frame.pc)?;
                    let to = frame.peek_at(0)?.clone();
                    let from = frame.peek_at(1)?.clone();
                    match (&from, &to) {
                        (Value::Int(from), Value::Int(to)) => {
                            if from > to {
                                frame.pop()?;
                                frame.pop()?;
                                frame.jump(end);
                            } else {
                                frame.set_var(var, Value::Int(*from))?;
                                match from.checked_add(1) {
                                    Some(next) => frame.poke(1, Value::Int(next))?,
                                    None => {
                                        // The loop variable hit the top of the
                                        // integer range.
                                        frame.pop()?;
                                        frame.pop()?;
                                        raise!(frame, ErrCode::E_RANGE);
                                    }
                                }
                            }
                        }
                        _ => {
                            frame.pop()?;
                            frame.pop()?;
                            raise!(
                                frame,
                                ErrCode::E_TYPE,
                                "for-range bounds must be integers".to_string()
                            );
                        }
                    }
                }

                // ===== Objects =====
                Opcode::GetProp => {
                    let name = frame.pop()?;
                    let Value::Str(name) = name else {
                        frame.pop()?;
                        raise!(frame, ErrCode::E_TYPE);
                        continue;
                    };
                    let Value::Obj(obj) = frame.peek()? else {
                        frame.pop()?;
                        raise!(frame, ErrCode::E_INVIND);
                        continue;
                    };
                    let obj = *obj;
                    let perms = frame.permissions;
                    match self.world.retrieve_property(perms, obj, &name) {
                        Ok(v) => frame.poke(0, v)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::PutProp => {
                    let value = frame.pop()?;
                    let name = frame.pop()?;
                    let Value::Str(name) = name else {
                        frame.pop()?;
                        raise!(frame, ErrCode::E_TYPE);
                        continue;
                    };
                    let Value::Obj(obj) = frame.peek()? else {
                        frame.pop()?;
                        raise!(frame, ErrCode::E_INVIND);
                        continue;
                    };
                    let obj = *obj;
                    let perms = frame.permissions;
                    match self.world.update_property(perms, obj, &name, &value) {
                        Ok(()) => frame.poke(0, value)?,
                        Err(code) => {
                            frame.pop()?;
                            raise!(frame, code);
                        }
                    }
                }
                Opcode::CallVerb => {
                    let args = frame.pop()?;
                    let verb = frame.pop()?;
                    let this = frame.pop()?;
                    let Value::List(args) = args else {
                        raise!(frame, ErrCode::E_TYPE);
                        continue;
                    };
                    let Value::Str(verb) = verb else {
                        raise!(frame, ErrCode::E_TYPE);
                        continue;
                    };
                    return Ok(FrameResult::CallVerb {
                        this,
                        verb: verb.to_string(),
                        args,
                        pass: false,
                    });
                }
                Opcode::Pass => {
                    let args = frame.pop()?;
                    let Value::List(args) = args else {
                        raise!(frame, ErrCode::E_TYPE);
                        continue;
                    };
                    return Ok(FrameResult::CallVerb {
                        this: frame.this.clone(),
                        verb: frame.verb_name.clone(),
                        args,
                        pass: true,
                    });
                }

                // ===== Exception handling =====
                Opcode::PushCatch => {
                    let label = read_u16(code, &mut frame.pc)?;
                    let codes_val = frame.pop()?;
                    let codes = match codes_val {
                        Value::Int(0) => CatchCodes::Any,
                        Value::List(l) if l.iter().all(|v| matches!(v, Value::Err(_))) => {
                            CatchCodes::Codes(l)
                        }
                        _ => {
                            raise!(frame, ErrCode::E_INVARG);
                            continue;
                        }
                    };
                    frame.push(Value::Catch(CatchMarker {
                        codes,
                        handler: label,
                    }))?;
                }
                Opcode::EndExcept => {
                    let label = read_u16(code, &mut frame.pc)?;
                    let count = read_u8(code, &mut frame.pc)?;
                    for _ in 0..count {
                        let marker = frame.pop()?;
                        if !matches!(marker, Value::Catch(_)) {
                            return Err(VmError::Corrupt(
                                "except epilogue without catch marker".into(),
                            ));
                        }
                    }
                    frame.jump(label);
                }
                Opcode::EndCatch => {
                    let label = read_u16(code, &mut frame.pc)?;
                    let result = frame.pop()?;
                    let marker = frame.pop()?;
                    if !matches!(marker, Value::Catch(_)) {
                        return Err(VmError::Corrupt(
                            "catch epilogue without catch marker".into(),
                        ));
                    }
                    frame.push(result)?;
                    frame.jump(label);
                }
                Opcode::PushFinally => {
                    let label = read_u16(code, &mut frame.pc)?;
                    frame.push(Value::Finally(FinallyMarker { handler: label }))?;
                }
                Opcode::EndFinally => {
                    let marker = frame.pop()?;
                    if !matches!(marker, Value::Finally(_)) {
                        return Err(VmError::Corrupt(
                            "finally epilogue without finally marker".into(),
                        ));
                    }
                    let (code_v, value) = unwind::fallthrough_pair();
                    frame.push(code_v)?;
                    frame.push(value)?;
                }
                Opcode::FinallyContinue => {
                    let value = frame.pop()?;
                    let code_v = frame.pop()?;
                    match unwind::decode_reason(&code_v, value)? {
                        None => {}
                        Some(reason) => return Ok(FrameResult::Unwind(reason)),
                    }
                }
                Opcode::Exit => {
                    let stack = read_u16(code, &mut frame.pc)? as usize;
                    let label = read_u16(code, &mut frame.pc)?;
                    return Ok(FrameResult::Unwind(UnwindReason::Exit { stack, label }));
                }

                // ===== Calls & tasks =====
                Opcode::CallNative => {
                    let id = read_u16(code, &mut frame.pc)?;
                    let args = frame.pop()?;
                    let Value::List(args) = args else {
                        raise!(frame, ErrCode::E_TYPE);
                        continue;
                    };
                    return Ok(FrameResult::CallNative { id, args });
                }
                Opcode::Fork => {
                    let index = read_u16(code, &mut frame.pc)?;
                    if program
                        .vector(hearth_bytecode::VectorId::Fork(index))
                        .is_none()
                    {
                        return Err(VmError::Corrupt(format!("fork vector {index} missing")));
                    }
                    let delay = frame.pop()?;
                    let delay = match delay {
                        Value::Int(s) if s >= 0 => Duration::from_secs(s as u64),
                        Value::Float(s) if s >= 0.0 => Duration::from_secs_f64(s),
                        Value::Int(_) | Value::Float(_) => {
                            raise!(
                                frame,
                                ErrCode::E_INVARG,
                                "invalid delay time in fork".to_string()
                            );
                            continue;
                        }
                        _ => {
                            raise!(frame, ErrCode::E_TYPE);
                            continue;
                        }
                    };
                    return Ok(FrameResult::Fork { index, delay });
                }
                Opcode::Return => {
                    let value = frame.pop()?;
                    return Ok(FrameResult::Return(value));
                }
                Opcode::Return0 => return Ok(FrameResult::Return(Value::Int(0))),
                Opcode::Done => return Ok(FrameResult::Return(Value::Int(0))),
            }
        }
    }
}

// ===== Operand readers =====

#[inline]
fn read_u8(code: &[u8], pc: &mut usize) -> VmResult<u8> {
    let byte = *code.get(*pc).ok_or(VmError::TruncatedBytecode(*pc))?;
    *pc += 1;
    Ok(byte)
}

#[inline]
fn read_u16(code: &[u8], pc: &mut usize) -> VmResult<u16> {
    let bytes = code
        .get(*pc..*pc + 2)
        .ok_or(VmError::TruncatedBytecode(*pc))?;
    *pc += 2;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
fn read_i64(code: &[u8], pc: &mut usize) -> VmResult<i64> {
    let bytes = code
        .get(*pc..*pc + 8)
        .ok_or(VmError::TruncatedBytecode(*pc))?;
    *pc += 8;
    Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
}

#[inline]
fn read_f64(code: &[u8], pc: &mut usize) -> VmResult<f64> {
    let bytes = code
        .get(*pc..*pc + 8)
        .ok_or(VmError::TruncatedBytecode(*pc))?;
    *pc += 8;
    Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
}

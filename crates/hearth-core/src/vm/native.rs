//! Native-function call protocol
//!
//! Native (host-provided) functions are invoked with the argument list, a
//! step counter, and a continuation slot, and answer with a
//! [`NativeOutcome`]. A native that needs a verb call issues `Call` and is
//! re-entered, step incremented, when that call returns; one that needs to
//! block issues `Suspend` and is re-entered with the resumption value. The
//! continuation slot is a [`Value`], so parked state serializes with the
//! rest of the task.
//!
//! The handful of natives that are part of the VM's own contract with the
//! scheduler (suspend/read/kill/resume and budget introspection) are
//! registered by [`register_core_natives`]; every other builtin body belongs
//! to the host.

use super::suspend::ResumeValue;
use super::unwind::Exception;
use super::{AbortReason, ExecCtx, WakeCondition};
use crate::activation::Activation;
use crate::db::WorldState;
use crate::host::Host;
use crate::scheduler::TaskId;
use crate::var::{v_str, ErrCode, List, ObjId, Value};
use rustc_hash::FxHashMap;
use std::time::Duration;

/// A native function body
pub type NativeFn = fn(&mut NativeArgs<'_>) -> NativeOutcome;

/// Everything a native function may touch
pub struct NativeArgs<'a> {
    /// Argument list; on re-entry, a one-element list holding the nested
    /// call's result or the resumption value
    pub args: List,
    /// 1 on first entry, incremented per re-entry
    pub step: u8,
    /// Continuation slot carried between steps
    pub data: Value,
    /// Player the task runs on behalf of
    pub player: ObjId,
    /// Calling principal
    pub permissions: ObjId,
    /// Task-local storage, survives suspend/resume
    pub task_local: &'a mut Value,
    /// The object database
    pub world: &'a mut dyn WorldState,
    /// The host environment
    pub host: &'a mut dyn Host,
    /// Scheduler operations
    pub sched: &'a mut dyn SchedulerOps,
    /// Execution budget, read-only
    pub ctx: &'a ExecCtx,
}

/// What a native function asks the interpreter to do next
pub enum NativeOutcome {
    /// Push the value and continue
    Ret(Value),
    /// Hand this to the unwind engine as a raise
    Raise(Exception),
    /// Perform a verb call and re-enter me with the result
    Call {
        /// Dispatch target
        this: ObjId,
        /// Verb name
        verb: String,
        /// Arguments
        args: List,
        /// My continuation state for the re-entry
        data: Value,
    },
    /// Delegate dispatch without a continuation: the callee's return value
    /// flows straight to my caller
    TailCall {
        /// Dispatch target
        this: ObjId,
        /// Verb name
        verb: String,
        /// Arguments
        args: List,
    },
    /// Park the task; re-enter me with the resumption value
    Suspend {
        /// What wakes the task
        wake: WakeCondition,
        /// My continuation state across the suspension
        data: Value,
    },
    /// Force an abort, as if a limit had been hit
    Kill(AbortReason),
}

/// Scheduler operations reachable from inside a running task
pub trait SchedulerOps {
    /// Id of the currently running task
    fn current_task_id(&self) -> TaskId;

    /// Queue a forked frame, eligible after `delay`; enforces the owner's
    /// background-task quota
    fn fork_task(&mut self, frame: Activation, delay: Duration) -> Result<TaskId, ErrCode>;

    /// Remove a queued or suspended task
    fn kill_task(&mut self, id: TaskId, perms: ObjId) -> Result<(), ErrCode>;

    /// Wake a suspended task with a value or error
    fn resume_task(&mut self, id: TaskId, value: ResumeValue, perms: ObjId)
        -> Result<(), ErrCode>;

    /// Introspection: queued and suspended tasks visible to `perms`
    fn queued_tasks(&self, perms: ObjId) -> List;

    /// Introspection: the call stack of a suspended task
    fn task_stack(&self, id: TaskId, perms: ObjId) -> Result<List, ErrCode>;
}

/// One registry entry
pub struct NativeDef {
    /// Function name as written in source
    pub name: String,
    /// Minimum argument count
    pub min_args: usize,
    /// Maximum argument count; `None` is unbounded
    pub max_args: Option<usize>,
    /// The body
    pub func: NativeFn,
    /// Invoked when unwinding tears down a frame holding this native's
    /// continuation data
    pub cleanup: Option<fn(&Value)>,
    /// Invoked on continuation data loaded from durable storage; an error
    /// fails the resumption instead of corrupting the VM
    pub revive: Option<fn(&Value) -> Result<Value, ErrCode>>,
}

/// Name/arity-checked registry of native functions
#[derive(Default)]
pub struct NativeRegistry {
    defs: Vec<NativeDef>,
    by_name: FxHashMap<String, u16>,
}

impl NativeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native; ids are dense and assigned in registration order
    pub fn register(
        &mut self,
        name: &str,
        min_args: usize,
        max_args: Option<usize>,
        func: NativeFn,
    ) -> u16 {
        self.register_def(NativeDef {
            name: name.to_string(),
            min_args,
            max_args,
            func,
            cleanup: None,
            revive: None,
        })
    }

    /// Register a fully-specified entry
    pub fn register_def(&mut self, def: NativeDef) -> u16 {
        let id = self.defs.len() as u16;
        self.by_name.insert(def.name.clone(), id);
        self.defs.push(def);
        id
    }

    /// Look up an id by name
    pub fn id(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Entry by id
    pub fn def(&self, id: u16) -> Option<&NativeDef> {
        self.defs.get(id as usize)
    }

    /// Name by id, for tracebacks
    pub fn name(&self, id: u16) -> &str {
        self.def(id).map(|d| d.name.as_str()).unwrap_or("?")
    }

    /// Whether an id is registered
    pub fn contains(&self, id: u16) -> bool {
        (id as usize) < self.defs.len()
    }

    /// Check an argument count against the declared arity
    pub fn check_arity(&self, id: u16, count: usize) -> Result<(), ErrCode> {
        let def = self.def(id).ok_or(ErrCode::E_INVARG)?;
        if count < def.min_args || def.max_args.is_some_and(|max| count > max) {
            return Err(ErrCode::E_ARGS);
        }
        Ok(())
    }

    /// Release continuation data during unwind teardown
    pub fn cleanup(&self, id: u16, data: &Value) {
        if let Some(cleanup) = self.def(id).and_then(|d| d.cleanup) {
            cleanup(data);
        }
    }

    /// Rehydrate continuation data loaded from storage
    pub fn revive(&self, id: u16, data: &Value) -> Result<Value, ErrCode> {
        match self.def(id) {
            None => Err(ErrCode::E_INVARG),
            Some(def) => match def.revive {
                Some(revive) => revive(data),
                None => Ok(data.clone()),
            },
        }
    }
}

// ===== Core natives =====

/// Register the scheduler-facing natives the VM itself depends on
pub fn register_core_natives(reg: &mut NativeRegistry) {
    reg.register("suspend", 0, Some(1), bf_suspend);
    reg.register("read", 0, Some(0), bf_read);
    reg.register("task_id", 0, Some(0), bf_task_id);
    reg.register("kill_task", 1, Some(1), bf_kill_task);
    reg.register("resume", 1, Some(2), bf_resume);
    reg.register("queued_tasks", 0, Some(0), bf_queued_tasks);
    reg.register("task_stack", 1, Some(1), bf_task_stack);
    reg.register("ticks_left", 0, Some(0), bf_ticks_left);
    reg.register("seconds_left", 0, Some(0), bf_seconds_left);
    reg.register("raise", 1, Some(3), bf_raise);
    reg.register("notify", 2, Some(2), bf_notify);
    reg.register("typeof", 1, Some(1), bf_typeof);
}

fn resumption_value(args: &List) -> Value {
    args.index(1).unwrap_or(Value::Int(0))
}

fn bf_suspend(a: &mut NativeArgs<'_>) -> NativeOutcome {
    if a.step > 1 {
        return NativeOutcome::Ret(resumption_value(&a.args));
    }
    let wake = match a.args.as_slice() {
        [] => WakeCondition::Never,
        [Value::Int(s)] if *s >= 0 => WakeCondition::Time(Duration::from_secs(*s as u64)),
        [Value::Float(s)] if *s >= 0.0 => WakeCondition::Time(Duration::from_secs_f64(*s)),
        [Value::Int(_) | Value::Float(_)] => {
            return NativeOutcome::Raise(Exception::new(ErrCode::E_INVARG))
        }
        _ => return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE)),
    };
    NativeOutcome::Suspend {
        wake,
        data: Value::Int(0),
    }
}

fn bf_read(a: &mut NativeArgs<'_>) -> NativeOutcome {
    if a.step > 1 {
        return NativeOutcome::Ret(resumption_value(&a.args));
    }
    NativeOutcome::Suspend {
        wake: WakeCondition::Input,
        data: Value::Int(0),
    }
}

fn bf_task_id(a: &mut NativeArgs<'_>) -> NativeOutcome {
    NativeOutcome::Ret(Value::Int(a.sched.current_task_id().as_u64() as i64))
}

fn bf_kill_task(a: &mut NativeArgs<'_>) -> NativeOutcome {
    let Ok(Value::Int(id)) = a.args.index(1) else {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE));
    };
    if id < 0 {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_INVARG));
    }
    let id = TaskId::from_u64(id as u64);
    if id == a.sched.current_task_id() {
        // Killing yourself is an immediate forced abort.
        return NativeOutcome::Kill(AbortReason::Kill);
    }
    match a.sched.kill_task(id, a.permissions) {
        Ok(()) => NativeOutcome::Ret(Value::Int(0)),
        Err(code) => NativeOutcome::Raise(Exception::new(code)),
    }
}

fn bf_resume(a: &mut NativeArgs<'_>) -> NativeOutcome {
    let Ok(Value::Int(id)) = a.args.index(1) else {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE));
    };
    if id < 0 {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_INVARG));
    }
    let value = a.args.index(2).unwrap_or(Value::Int(0));
    match a
        .sched
        .resume_task(TaskId::from_u64(id as u64), ResumeValue::Push(value), a.permissions)
    {
        Ok(()) => NativeOutcome::Ret(Value::Int(0)),
        Err(code) => NativeOutcome::Raise(Exception::new(code)),
    }
}

fn bf_queued_tasks(a: &mut NativeArgs<'_>) -> NativeOutcome {
    NativeOutcome::Ret(Value::List(a.sched.queued_tasks(a.permissions)))
}

fn bf_task_stack(a: &mut NativeArgs<'_>) -> NativeOutcome {
    let Ok(Value::Int(id)) = a.args.index(1) else {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE));
    };
    if id < 0 {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_INVARG));
    }
    match a.sched.task_stack(TaskId::from_u64(id as u64), a.permissions) {
        Ok(stack) => NativeOutcome::Ret(Value::List(stack)),
        Err(code) => NativeOutcome::Raise(Exception::new(code)),
    }
}

fn bf_ticks_left(a: &mut NativeArgs<'_>) -> NativeOutcome {
    NativeOutcome::Ret(Value::Int(a.ctx.ticks_left() as i64))
}

fn bf_seconds_left(a: &mut NativeArgs<'_>) -> NativeOutcome {
    NativeOutcome::Ret(Value::Int(a.ctx.seconds_left().as_secs() as i64))
}

fn bf_raise(a: &mut NativeArgs<'_>) -> NativeOutcome {
    let Ok(Value::Err(code)) = a.args.index(1) else {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE));
    };
    let msg = match a.args.index(2) {
        Ok(Value::Str(s)) => s.to_string(),
        Ok(_) => return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE)),
        Err(_) => code.message().to_string(),
    };
    let value = a.args.index(3).unwrap_or(Value::Int(0));
    NativeOutcome::Raise(Exception { code, msg, value })
}

fn bf_notify(a: &mut NativeArgs<'_>) -> NativeOutcome {
    let (Ok(Value::Obj(player)), Ok(Value::Str(line))) = (a.args.index(1), a.args.index(2)) else {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE));
    };
    a.host.notify(player, &line);
    NativeOutcome::Ret(Value::Int(1))
}

fn bf_typeof(a: &mut NativeArgs<'_>) -> NativeOutcome {
    let Ok(value) = a.args.index(1) else {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_ARGS));
    };
    match value.type_code() {
        Some(code) => NativeOutcome::Ret(Value::Int(code)),
        None => NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE)),
    }
}

/// Introspection entry for one queued or suspended task
pub fn task_entry(id: TaskId, player: ObjId, state: &str, start_line: i64) -> Value {
    crate::var::v_list(vec![
        Value::Int(id.as_u64() as i64),
        Value::Obj(player),
        v_str(state),
        Value::Int(start_line),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{native_args_parts, NoSched};
    use crate::var::v_int;

    #[test]
    fn test_registry_ids_and_lookup() {
        let mut reg = NativeRegistry::new();
        register_core_natives(&mut reg);
        let suspend = reg.id("suspend").unwrap();
        assert_eq!(reg.name(suspend), "suspend");
        assert!(reg.id("no_such_native").is_none());
        assert!(reg.contains(suspend));
    }

    #[test]
    fn test_arity_checking() {
        let mut reg = NativeRegistry::new();
        register_core_natives(&mut reg);
        let suspend = reg.id("suspend").unwrap();
        assert_eq!(reg.check_arity(suspend, 0), Ok(()));
        assert_eq!(reg.check_arity(suspend, 1), Ok(()));
        assert_eq!(reg.check_arity(suspend, 2), Err(ErrCode::E_ARGS));

        let raise = reg.id("raise").unwrap();
        assert_eq!(reg.check_arity(raise, 0), Err(ErrCode::E_ARGS));
        assert_eq!(reg.check_arity(raise, 3), Ok(()));
    }

    #[test]
    fn test_suspend_first_step() {
        let (mut world, mut host, ctx) = native_args_parts();
        let mut sched = NoSched::default();
        let mut local = crate::var::v_empty_map();
        let mut a = NativeArgs {
            args: List::from_vec(vec![v_int(5)]),
            step: 1,
            data: v_int(0),
            player: ObjId(2),
            permissions: ObjId(2),
            task_local: &mut local,
            world: &mut world,
            host: &mut host,
            sched: &mut sched,
            ctx: &ctx,
        };
        match bf_suspend(&mut a) {
            NativeOutcome::Suspend {
                wake: WakeCondition::Time(d),
                ..
            } => assert_eq!(d, Duration::from_secs(5)),
            _ => panic!("expected suspend"),
        }

        a.args = List::from_vec(vec![v_int(-1)]);
        assert!(matches!(
            bf_suspend(&mut a),
            NativeOutcome::Raise(Exception {
                code: ErrCode::E_INVARG,
                ..
            })
        ));

        a.args = List::new();
        assert!(matches!(
            bf_suspend(&mut a),
            NativeOutcome::Suspend {
                wake: WakeCondition::Never,
                ..
            }
        ));
    }

    #[test]
    fn test_suspend_reentry_returns_resumption_value() {
        let (mut world, mut host, ctx) = native_args_parts();
        let mut sched = NoSched::default();
        let mut local = crate::var::v_empty_map();
        let mut a = NativeArgs {
            args: List::from_vec(vec![v_int(99)]),
            step: 2,
            data: v_int(0),
            player: ObjId(2),
            permissions: ObjId(2),
            task_local: &mut local,
            world: &mut world,
            host: &mut host,
            sched: &mut sched,
            ctx: &ctx,
        };
        match bf_suspend(&mut a) {
            NativeOutcome::Ret(v) => assert_eq!(v, v_int(99)),
            _ => panic!("expected return"),
        }
    }

    #[test]
    fn test_raise_native() {
        let (mut world, mut host, ctx) = native_args_parts();
        let mut sched = NoSched::default();
        let mut local = crate::var::v_empty_map();
        let mut a = NativeArgs {
            args: List::from_vec(vec![
                Value::Err(ErrCode::E_PERM),
                v_str("not yours"),
                v_int(7),
            ]),
            step: 1,
            data: v_int(0),
            player: ObjId(2),
            permissions: ObjId(2),
            task_local: &mut local,
            world: &mut world,
            host: &mut host,
            sched: &mut sched,
            ctx: &ctx,
        };
        match bf_raise(&mut a) {
            NativeOutcome::Raise(exc) => {
                assert_eq!(exc.code, ErrCode::E_PERM);
                assert_eq!(exc.msg, "not yours");
                assert_eq!(exc.value, v_int(7));
            }
            _ => panic!("expected raise"),
        }
    }
}

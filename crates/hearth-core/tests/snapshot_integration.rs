//! Suspend/resume and durable snapshot round-trips

use hearth_bytecode::{text::LineReader, Literal, Opcode, Program, ProgramBuilder};
use hearth_core::persist::{read_snapshot, write_snapshot};
use hearth_core::testing::{MemWorld, NoSched, RecordingHost};
use hearth_core::var::{v_int, v_str, ErrCode, List, ObjId, Value};
use hearth_core::vm::{
    register_core_natives, ExecCtx, Interp, NativeArgs, NativeOutcome, NativeRegistry,
    ResumeValue, Snapshot, TaskOutcome, Vm, WakeCondition,
};
use hearth_core::{Activation, Exception};
use std::sync::Arc;
use std::time::Duration;

fn natives() -> NativeRegistry {
    let mut reg = NativeRegistry::new();
    register_core_natives(&mut reg);
    reg
}

fn root_frame(program: Arc<Program>) -> Activation {
    Activation::for_call(
        program,
        Value::Obj(ObjId(10)),
        ObjId(2),
        Value::Obj(ObjId::NOTHING),
        ObjId(10),
        ObjId(2),
        "test",
        "test",
        true,
        List::new(),
        "",
        ObjId::NOTHING,
        ObjId::NOTHING,
    )
}

struct Runner {
    world: MemWorld,
    host: RecordingHost,
    natives: NativeRegistry,
    sched: NoSched,
}

impl Runner {
    fn new(natives: NativeRegistry) -> Self {
        Self {
            world: MemWorld::new(),
            host: RecordingHost::default(),
            natives,
            sched: NoSched::default(),
        }
    }

    fn run(&mut self, program: Arc<Program>) -> TaskOutcome {
        let vm = Vm::new(root_frame(program), 50);
        let mut interp = Interp::new(
            &mut self.world,
            &mut self.host,
            &self.natives,
            &mut self.sched,
            ExecCtx::new(100_000, Duration::from_secs(10)),
        );
        interp.run(vm).unwrap()
    }

    fn resume(&mut self, snapshot: Snapshot, value: ResumeValue) -> TaskOutcome {
        let mut interp = Interp::new(
            &mut self.world,
            &mut self.host,
            &self.natives,
            &mut self.sched,
            ExecCtx::new(100_000, Duration::from_secs(10)),
        );
        interp.resume(snapshot, value).unwrap()
    }
}

fn done(outcome: TaskOutcome) -> Value {
    match outcome {
        TaskOutcome::Done(v) => v,
        other => panic!("expected Done, got {other:?}"),
    }
}

fn suspended(outcome: TaskOutcome) -> (Snapshot, WakeCondition) {
    match outcome {
        TaskOutcome::Suspended(req) => (req.snapshot, req.wake),
        other => panic!("expected Suspended, got {other:?}"),
    }
}

/// Two-frame program pair: `outer` calls #10:inner(), whose body is either
/// `return suspend() + 1` or `return 42 + 1`, and doubles the result.
fn build_outer() -> ProgramBuilder {
    let mut outer = ProgramBuilder::new();
    outer.imm(Literal::Obj(10));
    outer.imm(Literal::Str("inner".into()));
    outer.op(Opcode::ImmEmptyList);
    outer.op(Opcode::CallVerb);
    outer.imm_int(2);
    outer.op(Opcode::Mul);
    outer.op(Opcode::Return);
    outer
}

fn build_inner_suspending(reg: &NativeRegistry) -> ProgramBuilder {
    let mut inner = ProgramBuilder::new();
    inner.op(Opcode::ImmEmptyList);
    inner.call_native(reg.id("suspend").unwrap());
    inner.imm_int(1);
    inner.op(Opcode::Add);
    inner.op(Opcode::Return);
    inner
}

#[test]
fn test_suspend_resume_matches_direct_return() {
    // Suspending at depth two and resuming with 42 must behave exactly as
    // if suspend() had returned 42 directly.
    let reg = natives();
    let mut runner = Runner::new(natives());
    runner.world.add_object(ObjId(10), None);
    runner.world.add_verb(
        ObjId(10),
        "inner",
        Arc::new(build_inner_suspending(&reg).build()),
        true,
    );
    let outcome = runner.run(Arc::new(build_outer().build()));
    let (snapshot, wake) = suspended(outcome);
    assert_eq!(wake, WakeCondition::Never);
    assert_eq!(snapshot.frames.len(), 3); // outer, inner, native continuation
    let resumed = runner.resume(snapshot, ResumeValue::Push(v_int(42)));
    assert_eq!(done(resumed), v_int(86));

    // The direct-return version of the same computation.
    let mut direct_inner = ProgramBuilder::new();
    direct_inner.imm_int(42);
    direct_inner.imm_int(1);
    direct_inner.op(Opcode::Add);
    direct_inner.op(Opcode::Return);
    let mut direct = Runner::new(natives());
    direct.world.add_object(ObjId(10), None);
    direct
        .world
        .add_verb(ObjId(10), "inner", Arc::new(direct_inner.build()), true);
    assert_eq!(done(direct.run(Arc::new(build_outer().build()))), v_int(86));
}

#[test]
fn test_resume_with_error_raises_at_suspension_point() {
    // The inner verb catches what resume throws into it.
    let reg = natives();
    let mut inner = ProgramBuilder::new();
    let handler = inner.label();
    let end = inner.label();
    inner.imm_int(0);
    inner.jump(Opcode::PushCatch, handler);
    inner.op(Opcode::ImmEmptyList);
    inner.call_native(reg.id("suspend").unwrap());
    inner.op(Opcode::Pop);
    inner.end_except(end, 1);
    inner.here(handler);
    inner.imm_int(1).op(Opcode::Index);
    inner.op(Opcode::Return);
    inner.here(end);
    inner.imm_int(0).op(Opcode::Return);

    let mut runner = Runner::new(natives());
    runner.world.add_object(ObjId(10), None);
    runner
        .world
        .add_verb(ObjId(10), "inner", Arc::new(inner.build()), true);
    let outcome = runner.run(Arc::new(build_outer().build()));
    let (snapshot, _) = suspended(outcome);

    let resumed = runner.resume(
        snapshot,
        ResumeValue::Raise(Exception::new(ErrCode::E_NACC)),
    );
    // Handler returned the code; outer doubled... errors don't multiply, so
    // the outer frame's Mul raises E_TYPE and nothing catches it.
    assert!(matches!(resumed, TaskOutcome::Aborted(_)));
    assert_eq!(runner.host.uncaught[0].0.code, ErrCode::E_TYPE);
}

#[test]
fn test_snapshot_survives_durable_roundtrip() {
    // Park, write to text, read back, revive, resume: same result.
    let reg = natives();
    let mut runner = Runner::new(natives());
    runner.world.add_object(ObjId(10), None);
    runner.world.add_verb(
        ObjId(10),
        "inner",
        Arc::new(build_inner_suspending(&reg).build()),
        true,
    );
    let outcome = runner.run(Arc::new(build_outer().build()));
    let (snapshot, _) = suspended(outcome);

    let mut buf = Vec::new();
    write_snapshot(&mut buf, &snapshot).unwrap();
    drop(snapshot);

    let mut reader = LineReader::new(&buf[..]);
    let mut restored = read_snapshot(&mut reader).unwrap();
    restored.revive(&runner.natives).unwrap();
    assert_eq!(restored.frames.len(), 3);

    let resumed = runner.resume(restored, ResumeValue::Push(v_int(10)));
    assert_eq!(done(resumed), v_int(22));
}

// A host-registered native pair exercising task-local storage across a
// suspension: remember(v) parks the task after stashing v, recall() reads
// it back.
fn bf_remember(a: &mut NativeArgs<'_>) -> NativeOutcome {
    if a.step > 1 {
        return NativeOutcome::Ret(a.args.index(1).unwrap_or(Value::Int(0)));
    }
    let Ok(value) = a.args.index(1) else {
        return NativeOutcome::Raise(Exception::new(ErrCode::E_ARGS));
    };
    if let Value::Map(map) = a.task_local {
        if map.insert(v_str("v"), value).is_err() {
            return NativeOutcome::Raise(Exception::new(ErrCode::E_TYPE));
        }
    }
    NativeOutcome::Suspend {
        wake: WakeCondition::Never,
        data: Value::Int(0),
    }
}

fn bf_recall(a: &mut NativeArgs<'_>) -> NativeOutcome {
    match a.task_local {
        Value::Map(map) => NativeOutcome::Ret(map.get(&v_str("v")).unwrap_or(Value::Int(0))),
        _ => NativeOutcome::Ret(Value::Int(0)),
    }
}

#[test]
fn test_task_local_survives_persisted_suspension() {
    let mut reg = natives();
    reg.register("remember", 1, Some(1), bf_remember);
    reg.register("recall", 0, Some(0), bf_recall);

    let mut b = ProgramBuilder::new();
    b.op(Opcode::ImmEmptyList);
    b.imm_int(42).op(Opcode::ListAddTail);
    b.call_native(reg.id("remember").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::ImmEmptyList);
    b.call_native(reg.id("recall").unwrap());
    b.op(Opcode::Return);
    let program = Arc::new(b.build());

    let mut reg2 = natives();
    reg2.register("remember", 1, Some(1), bf_remember);
    reg2.register("recall", 0, Some(0), bf_recall);
    let mut runner = Runner::new(reg2);
    let (snapshot, wake) = suspended(runner.run(program));
    assert_eq!(wake, WakeCondition::Never);

    // Through the durable form and back.
    let mut buf = Vec::new();
    write_snapshot(&mut buf, &snapshot).unwrap();
    let mut reader = LineReader::new(&buf[..]);
    let mut restored = read_snapshot(&mut reader).unwrap();
    restored.revive(&runner.natives).unwrap();

    let resumed = runner.resume(restored, ResumeValue::Push(v_int(0)));
    assert_eq!(done(resumed), v_int(42));
}

#[test]
fn test_marker_laden_stack_roundtrips() {
    // A frame suspended inside a try/finally persists its markers.
    let reg = natives();
    let mut b = ProgramBuilder::new();
    let catch_h = b.label();
    let finally_h = b.label();
    let end = b.label();
    b.imm_int(0);
    b.jump(Opcode::PushCatch, catch_h);
    b.jump(Opcode::PushFinally, finally_h);
    b.op(Opcode::ImmEmptyList);
    b.call_native(reg.id("suspend").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::EndFinally);
    b.here(finally_h);
    b.op(Opcode::FinallyContinue);
    b.end_except(end, 1);
    b.here(catch_h);
    b.imm_int(1).op(Opcode::Index);
    b.op(Opcode::Return);
    b.here(end);
    b.imm_int(5).op(Opcode::Return);

    let mut runner = Runner::new(natives());
    let (snapshot, _) = suspended(runner.run(Arc::new(b.build())));

    let mut buf = Vec::new();
    write_snapshot(&mut buf, &snapshot).unwrap();
    let mut reader = LineReader::new(&buf[..]);
    let mut restored = read_snapshot(&mut reader).unwrap();
    restored.revive(&runner.natives).unwrap();

    // Raising into the restored task runs the finally, then the catch.
    let resumed = runner.resume(
        restored,
        ResumeValue::Raise(Exception::new(ErrCode::E_PERM)),
    );
    assert_eq!(done(resumed), Value::Err(ErrCode::E_PERM));
}

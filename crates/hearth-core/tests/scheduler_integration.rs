//! Scheduler behavior: fairness, timers, read interception, kill

use hearth_bytecode::{vars, Literal, Opcode, Program, ProgramBuilder};
use hearth_core::host::VerbCall;
use hearth_core::scheduler::{Scheduler, SchedulerOptions};
use hearth_core::testing::{MemWorld, RecordingHost};
use hearth_core::var::{List, ObjId, Value};
use hearth_core::vm::{register_core_natives, NativeRegistry, SchedulerOps};
use hearth_core::Activation;
use std::sync::Arc;
use std::time::Duration;

fn natives() -> NativeRegistry {
    let mut reg = NativeRegistry::new();
    register_core_natives(&mut reg);
    reg
}

/// Verb body: notify(player, <text>)
fn notify_program(reg: &NativeRegistry, text: &str) -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    b.op(Opcode::ImmEmptyList);
    b.push_var(vars::PLAYER);
    b.op(Opcode::ListAddTail);
    b.imm(Literal::Str(text.into()));
    b.op(Opcode::ListAddTail);
    b.call_native(reg.id("notify").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::Done);
    Arc::new(b.build())
}

fn frame_for(program: Arc<Program>, player: ObjId) -> Activation {
    Activation::for_call(
        program,
        Value::Obj(player),
        player,
        Value::Obj(ObjId::NOTHING),
        ObjId(10),
        player,
        "task",
        "task",
        true,
        List::new(),
        "",
        ObjId::NOTHING,
        ObjId::NOTHING,
    )
}

#[test]
fn test_round_robin_fairness_between_principals() {
    // Two principals, equal backlogs of equal-cost tasks: processed counts
    // never drift apart by more than one.
    let reg = natives();
    let mut world = MemWorld::new();
    let mut host = RecordingHost::default();
    let mut sched = Scheduler::new(SchedulerOptions::default());

    let alice = ObjId(1);
    let bob = ObjId(2);
    for _ in 0..10 {
        sched
            .fork_task(frame_for(notify_program(&reg, "a"), alice), Duration::ZERO)
            .unwrap();
        sched
            .fork_task(frame_for(notify_program(&reg, "b"), bob), Duration::ZERO)
            .unwrap();
    }

    let mut passes = 0;
    while sched.run_once(&mut world, &mut host, &reg) {
        passes += 1;
        let a_count = host.output.iter().filter(|(p, _)| *p == alice).count();
        let b_count = host.output.iter().filter(|(p, _)| *p == bob).count();
        assert!(
            a_count.abs_diff(b_count) <= 1,
            "fairness violated after pass {passes}: {a_count} vs {b_count}"
        );
        assert!(passes <= 30, "scheduler failed to drain");
    }
    assert_eq!(host.output.len(), 20);
}

#[test]
fn test_zero_delay_suspend_resumes_on_next_pass() {
    // suspend(0); notify("resumed")
    let reg = natives();
    let mut b = ProgramBuilder::new();
    b.op(Opcode::ImmEmptyList);
    b.imm_int(0).op(Opcode::ListAddTail);
    b.call_native(reg.id("suspend").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::ImmEmptyList);
    b.push_var(vars::PLAYER);
    b.op(Opcode::ListAddTail);
    b.imm(Literal::Str("resumed".into()));
    b.op(Opcode::ListAddTail);
    b.call_native(reg.id("notify").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::Done);

    let mut world = MemWorld::new();
    let mut host = RecordingHost::default();
    let mut sched = Scheduler::new(SchedulerOptions::default());
    sched
        .fork_task(frame_for(Arc::new(b.build()), ObjId(2)), Duration::ZERO)
        .unwrap();

    // First pass runs up to the suspension.
    assert!(sched.run_once(&mut world, &mut host, &reg));
    assert!(host.output.is_empty());
    assert_eq!(sched.task_count(), 1);

    // Second pass promotes the zero-delay timer and finishes the task.
    assert!(sched.run_once(&mut world, &mut host, &reg));
    assert_eq!(host.output, vec![(ObjId(2), "resumed".to_string())]);
    assert_eq!(sched.task_count(), 0);
}

#[test]
fn test_read_intercepts_next_input_line() {
    // Verb `ask`: line = read(); notify(player, line)
    let reg = natives();
    let mut b = ProgramBuilder::new();
    let line_var = b.var("line");
    b.op(Opcode::ImmEmptyList);
    b.call_native(reg.id("read").unwrap());
    b.put_var(line_var).op(Opcode::Pop);
    b.op(Opcode::ImmEmptyList);
    b.push_var(vars::PLAYER);
    b.op(Opcode::ListAddTail);
    b.push_var(line_var);
    b.op(Opcode::ListAddTail);
    b.call_native(reg.id("notify").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::Done);

    let mut world = MemWorld::new();
    world.add_object(ObjId(10), None);
    world.add_verb(ObjId(10), "ask", Arc::new(b.build()), true);

    let mut host = RecordingHost::default();
    host.commands.insert(
        "ask".into(),
        VerbCall {
            this: ObjId(10),
            verb: "ask".into(),
            args: List::new(),
            argstr: String::new(),
            dobj: ObjId::NOTHING,
            iobj: ObjId::NOTHING,
        },
    );

    let mut sched = Scheduler::new(SchedulerOptions::default());
    let player = ObjId(2);
    sched.enqueue_input(player, "ask".into(), &mut host);
    assert!(sched.run_once(&mut world, &mut host, &reg));
    // Parked on its read call.
    assert!(host.output.is_empty());
    assert_eq!(sched.task_count(), 1);

    // The next input line feeds the reader instead of command dispatch.
    sched.enqueue_input(player, "blue".into(), &mut host);
    assert!(sched.run_once(&mut world, &mut host, &reg));
    assert_eq!(host.output, vec![(player, "blue".to_string())]);
    assert_eq!(sched.task_count(), 0);
}

#[test]
fn test_client_kill_removes_waiting_task() {
    let reg = natives();
    let mut world = MemWorld::new();
    let mut host = RecordingHost::default();
    let mut sched = Scheduler::new(SchedulerOptions::default());

    let id = sched
        .fork_task(
            frame_for(notify_program(&reg, "never"), ObjId(2)),
            Duration::from_secs(3600),
        )
        .unwrap();
    assert_eq!(sched.task_count(), 1);

    sched.client().kill_task(id);
    sched.run_once(&mut world, &mut host, &reg);
    assert_eq!(sched.task_count(), 0);
    assert!(host.output.is_empty());
}

#[test]
fn test_client_resume_wakes_indefinite_suspension() {
    // suspend(); notify("woke")
    let reg = natives();
    let mut b = ProgramBuilder::new();
    b.op(Opcode::ImmEmptyList);
    b.call_native(reg.id("suspend").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::ImmEmptyList);
    b.push_var(vars::PLAYER);
    b.op(Opcode::ListAddTail);
    b.imm(Literal::Str("woke".into()));
    b.op(Opcode::ListAddTail);
    b.call_native(reg.id("notify").unwrap());
    b.op(Opcode::Pop);
    b.op(Opcode::Done);

    let mut world = MemWorld::new();
    let mut host = RecordingHost::default();
    let mut sched = Scheduler::new(SchedulerOptions::default());
    sched
        .fork_task(frame_for(Arc::new(b.build()), ObjId(2)), Duration::ZERO)
        .unwrap();

    assert!(sched.run_once(&mut world, &mut host, &reg));
    assert_eq!(sched.task_count(), 1);
    // Sleeping forever: passes do nothing until a resume arrives.
    assert!(!sched.run_once(&mut world, &mut host, &reg));

    let listing = sched.queued_tasks(ObjId(2));
    assert_eq!(listing.len(), 1);
    let Value::List(entry) = listing.index(1).unwrap() else {
        panic!("task entry is not a list");
    };
    let Value::Int(raw_id) = entry.index(1).unwrap() else {
        panic!("task id is not an int");
    };

    sched.client().resume_task(
        hearth_core::TaskId::from_u64(raw_id as u64),
        hearth_core::ResumeValue::Push(Value::Int(1)),
    );
    assert!(sched.run_once(&mut world, &mut host, &reg));
    assert_eq!(host.output, vec![(ObjId(2), "woke".to_string())]);
    assert_eq!(sched.task_count(), 0);
}

#[test]
fn test_forked_vector_runs_with_captured_environment() {
    // x = 7; fork(0) with the fork body notifying only if x == 7.
    let reg = natives();
    let mut b = ProgramBuilder::new();
    let x = b.var("x");
    let fork = b.start_fork();
    let skip = b.label();
    b.push_var(x);
    b.imm_int(7);
    b.op(Opcode::Eq);
    b.jump(Opcode::IfFalse, skip);
    b.op(Opcode::ImmEmptyList);
    b.push_var(vars::PLAYER);
    b.op(Opcode::ListAddTail);
    b.imm(Literal::Str("captured".into()));
    b.op(Opcode::ListAddTail);
    b.call_native(reg.id("notify").unwrap());
    b.op(Opcode::Pop);
    b.here(skip);
    b.op(Opcode::Done);
    b.select_main();
    b.imm_int(7).put_var(x).op(Opcode::Pop);
    b.imm_int(0);
    b.fork(fork);
    b.op(Opcode::Done);

    let mut world = MemWorld::new();
    let mut host = RecordingHost::default();
    let mut sched = Scheduler::new(SchedulerOptions::default());
    sched
        .fork_task(frame_for(Arc::new(b.build()), ObjId(2)), Duration::ZERO)
        .unwrap();

    // Pass 1 runs the main body (which forks), pass 2 runs the fork body.
    assert!(sched.run_once(&mut world, &mut host, &reg));
    assert!(sched.run_once(&mut world, &mut host, &reg));
    assert_eq!(host.output, vec![(ObjId(2), "captured".to_string())]);
}

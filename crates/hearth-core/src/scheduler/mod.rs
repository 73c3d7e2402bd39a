//! Cooperative task-queue scheduler
//!
//! One queue per owning principal, two sub-lists per queue (sequenced input,
//! background work), one global time-ordered waiting list, and round-robin
//! dispatch over active queues ordered by a usage counter that grows with
//! wall-clock time consumed. Exactly one task's interpreter runs at a time;
//! everything mutable lives on the scheduler's thread, and other threads
//! talk to it only through the [`SchedulerClient`] command channel.

pub mod queue;
pub mod task;

pub use queue::PlayerQueue;
pub use task::{Task, TaskId, TaskKind};

use crate::activation::Activation;
use crate::db::WorldState;
use crate::host::Host;
use crate::var::{v_str, ErrCode, List, ObjId, Value};
use crate::vm::native::{task_entry, NativeRegistry, SchedulerOps};
use crate::vm::{
    Exception, ExecCtx, Interp, ResumeValue, Snapshot, SuspendRequest, TaskOutcome, Vm,
    WakeCondition,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// How long the idle scheduler loop waits for a command
const SCHEDULER_TICK_TIME: Duration = Duration::from_millis(5);

/// Tunable limits and budgets
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Tick budget for foreground (command/input) tasks
    pub fg_ticks: usize,
    /// Wall-clock budget for foreground tasks
    pub fg_seconds: Duration,
    /// Tick budget for background (forked/resumed) tasks
    pub bg_ticks: usize,
    /// Wall-clock budget for background tasks
    pub bg_seconds: Duration,
    /// Task recursion limit
    pub max_depth: usize,
    /// Queued input lines that pause upstream delivery
    pub input_hiwater: usize,
    /// Queued input lines at which delivery resumes
    pub input_lowater: usize,
    /// Default cap on background tasks per principal
    pub default_bg_quota: Option<usize>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            fg_ticks: 60_000,
            fg_seconds: Duration::from_secs(5),
            bg_ticks: 30_000,
            bg_seconds: Duration::from_secs(3),
            max_depth: super::vm::DEFAULT_MAX_DEPTH,
            input_hiwater: 128,
            input_lowater: 8,
            default_bg_quota: None,
        }
    }
}

/// Commands other threads may send the scheduler
#[derive(Debug)]
pub enum SchedCmd {
    /// One line of input arrived for a player
    Input {
        /// The player
        player: ObjId,
        /// The line
        line: String,
    },
    /// Kill a queued or suspended task
    Kill {
        /// Target task
        id: TaskId,
    },
    /// Wake a suspended task with a value or error
    Resume {
        /// Target task
        id: TaskId,
        /// What to deliver at the suspension point
        value: ResumeValue,
    },
    /// Player connected or disconnected
    SetConnected {
        /// The player
        player: ObjId,
        /// New state
        connected: bool,
    },
    /// Change a principal's background-task quota
    SetQuota {
        /// The player
        player: ObjId,
        /// New cap; `None` removes it
        quota: Option<usize>,
    },
    /// Stop the scheduler loop
    Shutdown,
}

/// Cloneable handle for submitting commands to a running scheduler
#[derive(Clone)]
pub struct SchedulerClient {
    tx: Sender<SchedCmd>,
}

impl SchedulerClient {
    /// Enqueue one line of player input
    pub fn submit_input(&self, player: ObjId, line: impl Into<String>) {
        let _ = self.tx.send(SchedCmd::Input {
            player,
            line: line.into(),
        });
    }

    /// Kill a task by id
    pub fn kill_task(&self, id: TaskId) {
        let _ = self.tx.send(SchedCmd::Kill { id });
    }

    /// Resume a suspended task
    pub fn resume_task(&self, id: TaskId, value: ResumeValue) {
        let _ = self.tx.send(SchedCmd::Resume { id, value });
    }

    /// Record a player connection state change
    pub fn set_connected(&self, player: ObjId, connected: bool) {
        let _ = self.tx.send(SchedCmd::SetConnected { player, connected });
    }

    /// Change a principal's background-task quota
    pub fn set_quota(&self, player: ObjId, quota: Option<usize>) {
        let _ = self.tx.send(SchedCmd::SetQuota { player, quota });
    }

    /// Stop the scheduler loop
    pub fn shutdown(&self) {
        let _ = self.tx.send(SchedCmd::Shutdown);
    }
}

enum WorkItem {
    /// Feed the queue's next input line to its blocked reader
    FeedReader { reader: TaskId, input: TaskId },
    /// Dispatch the next input line as a command
    Command(TaskId),
    /// Run the next background task
    Background(TaskId),
}

enum Work {
    Fresh(Vm),
    Resume(Snapshot, ResumeValue),
}

/// The task scheduler
pub struct Scheduler {
    options: SchedulerOptions,
    queues: FxHashMap<ObjId, PlayerQueue>,
    tasks: FxHashMap<TaskId, Task>,
    /// Not-yet-eligible tasks, ordered by wake time
    waiting: Vec<(Instant, TaskId)>,
    next_task_id: u64,
    current: Option<(TaskId, ObjId)>,
    cmd_tx: Sender<SchedCmd>,
    cmd_rx: Receiver<SchedCmd>,
    running: bool,
}

impl Scheduler {
    /// Scheduler with the given options
    pub fn new(options: SchedulerOptions) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        Self {
            options,
            queues: FxHashMap::default(),
            tasks: FxHashMap::default(),
            waiting: Vec::new(),
            next_task_id: 0,
            current: None,
            cmd_tx,
            cmd_rx,
            running: false,
        }
    }

    /// Handle for submitting commands from other threads
    pub fn client(&self) -> SchedulerClient {
        SchedulerClient {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Number of queued and suspended tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn alloc_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        TaskId::from_u64(self.next_task_id)
    }

    fn queue_mut(&mut self, player: ObjId) -> &mut PlayerQueue {
        let quota = self.options.default_bg_quota;
        self.queues
            .entry(player)
            .or_insert_with(|| PlayerQueue::new(player, quota))
    }

    /// Enqueue one line of input for a player, applying the high watermark
    pub fn enqueue_input(&mut self, player: ObjId, line: String, host: &mut dyn Host) -> TaskId {
        let id = self.alloc_id();
        self.tasks.insert(
            id,
            Task {
                id,
                player,
                kind: TaskKind::Input(line),
                created: Instant::now(),
            },
        );
        let hiwater = self.options.input_hiwater;
        let queue = self.queue_mut(player);
        queue.input.push_back(id);
        if queue.input.len() >= hiwater && !queue.input_paused {
            queue.input_paused = true;
            host.set_input_flow(player, true);
        }
        id
    }

    fn release_input_flow(&mut self, player: ObjId, host: &mut dyn Host) {
        let lowater = self.options.input_lowater;
        if let Some(queue) = self.queues.get_mut(&player) {
            if queue.input_paused && queue.input.len() <= lowater {
                queue.input_paused = false;
                host.set_input_flow(player, false);
            }
        }
    }

    fn insert_waiting(&mut self, at: Instant, id: TaskId) {
        let pos = self.waiting.partition_point(|(t, _)| *t <= at);
        self.waiting.insert(pos, (at, id));
    }

    fn apply_cmd(&mut self, cmd: SchedCmd, host: &mut dyn Host) {
        match cmd {
            SchedCmd::Input { player, line } => {
                self.enqueue_input(player, line, host);
            }
            SchedCmd::Kill { id } => {
                // The channel is the trusted control plane; kill as owner.
                if let Some(owner) = self.tasks.get(&id).map(|t| t.player) {
                    let _ = SchedulerOps::kill_task(self, id, owner);
                }
            }
            SchedCmd::Resume { id, value } => {
                if let Some(owner) = self.tasks.get(&id).map(|t| t.player) {
                    if let Err(code) = SchedulerOps::resume_task(self, id, value, owner) {
                        warn!(task = id.as_u64(), %code, "resume command refused");
                    }
                }
            }
            SchedCmd::SetConnected { player, connected } => {
                self.queue_mut(player).connected = connected;
            }
            SchedCmd::SetQuota { player, quota } => {
                self.queue_mut(player).bg_quota = quota;
            }
            SchedCmd::Shutdown => {
                self.running = false;
            }
        }
    }

    /// Move time-eligible waiting tasks into their owners' background queues
    fn promote_waiting(&mut self) {
        let now = Instant::now();
        while let Some((at, _)) = self.waiting.first() {
            if *at > now {
                break;
            }
            let (_, id) = self.waiting.remove(0);
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if let TaskKind::Suspended { resume, .. } = &mut task.kind {
                // A timer wake delivers 0 unless a resume already set a value.
                resume.get_or_insert(ResumeValue::Push(Value::Int(0)));
            }
            let player = task.player;
            self.queue_mut(player).background.push_back(id);
        }
    }

    /// One scheduler pass: promote, pick active queues by usage, run at most
    /// one task per queue, discard dead queues. Returns whether anything ran.
    pub fn run_once(
        &mut self,
        world: &mut dyn WorldState,
        host: &mut dyn Host,
        natives: &NativeRegistry,
    ) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.apply_cmd(cmd, host);
        }
        self.promote_waiting();

        // Active queues, fairness-clamped: a queue entering the active set
        // has its usage raised to the minimum among already-active queues so
        // a long-idle principal cannot monopolize the scheduler.
        let min_usage = self
            .queues
            .values()
            .filter(|q| q.has_ready())
            .map(|q| q.usage)
            .min()
            .unwrap_or(Duration::ZERO);
        let mut active: Vec<(Duration, ObjId)> = Vec::new();
        for queue in self.queues.values_mut() {
            let is_active = queue.has_ready();
            if is_active && !queue.was_active {
                queue.usage = queue.usage.max(min_usage);
            }
            queue.was_active = is_active;
            if is_active {
                active.push((queue.usage, queue.player));
            }
        }
        active.sort_by_key(|(usage, player)| (*usage, player.0));

        let ran = !active.is_empty();
        for (_, player) in active {
            self.run_queue_task(player, world, host, natives);
        }

        self.queues
            .retain(|_, queue| queue.connected || !queue.is_empty());
        ran
    }

    /// Run the scheduler loop until shutdown
    #[instrument(skip_all)]
    pub fn run(
        &mut self,
        world: &mut dyn WorldState,
        host: &mut dyn Host,
        natives: &NativeRegistry,
    ) {
        self.running = true;
        info!("scheduler loop started");
        while self.running {
            let ran = self.run_once(world, host, natives);
            if !ran && self.running {
                let wait = self
                    .waiting
                    .first()
                    .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(SCHEDULER_TICK_TIME)
                    .min(SCHEDULER_TICK_TIME);
                if let Ok(cmd) = self.cmd_rx.recv_timeout(wait) {
                    self.apply_cmd(cmd, host);
                }
            }
        }
        info!("scheduler loop stopped");
    }

    fn run_queue_task(
        &mut self,
        player: ObjId,
        world: &mut dyn WorldState,
        host: &mut dyn Host,
        natives: &NativeRegistry,
    ) {
        let item = {
            let Some(queue) = self.queues.get_mut(&player) else {
                return;
            };
            if queue.reading.is_some() && !queue.input.is_empty() {
                let input = queue.input.pop_front().expect("input checked non-empty");
                let reader = queue.reading.take().expect("reader checked present");
                WorkItem::FeedReader { reader, input }
            } else if let Some(id) = queue.input.pop_front() {
                WorkItem::Command(id)
            } else if let Some(id) = queue.background.pop_front() {
                WorkItem::Background(id)
            } else {
                return;
            }
        };
        self.release_input_flow(player, host);

        match item {
            WorkItem::FeedReader { reader, input } => {
                let Some(line) = self.take_input_line(input) else {
                    return;
                };
                let Some(task) = self.tasks.remove(&reader) else {
                    return;
                };
                let TaskKind::Suspended { snapshot, .. } = task.kind else {
                    error!(task = reader.as_u64(), "reading task is not suspended");
                    return;
                };
                self.execute(
                    reader,
                    player,
                    Work::Resume(snapshot, ResumeValue::Push(v_str(&line))),
                    true,
                    world,
                    host,
                    natives,
                );
            }
            WorkItem::Command(id) => {
                let Some(line) = self.take_input_line(id) else {
                    return;
                };
                let Some(call) = host.parse_command(player, &line) else {
                    // The host handled the line itself.
                    return;
                };
                let info = match world.find_verb(player, call.this, &call.verb) {
                    Ok(info) => info,
                    Err(code) => {
                        debug!(%player, verb = %call.verb, %code, "command verb not found");
                        host.notify(player, "I couldn't understand that.");
                        return;
                    }
                };
                let frame = Activation::for_call(
                    info.program.clone(),
                    Value::Obj(call.this),
                    player,
                    Value::Obj(player),
                    info.definer,
                    info.owner,
                    &call.verb,
                    &info.names,
                    info.debug,
                    call.args,
                    &call.argstr,
                    call.dobj,
                    call.iobj,
                );
                let vm = Vm::new(frame, self.options.max_depth);
                self.execute(id, player, Work::Fresh(vm), true, world, host, natives);
            }
            WorkItem::Background(id) => {
                let Some(task) = self.tasks.remove(&id) else {
                    return;
                };
                match task.kind {
                    TaskKind::Fork(frame) => {
                        let vm = Vm::new(*frame, self.options.max_depth);
                        self.execute(id, player, Work::Fresh(vm), false, world, host, natives);
                    }
                    TaskKind::Suspended {
                        snapshot, resume, ..
                    } => {
                        let value = resume.unwrap_or(ResumeValue::Push(Value::Int(0)));
                        self.execute(
                            id,
                            player,
                            Work::Resume(snapshot, value),
                            false,
                            world,
                            host,
                            natives,
                        );
                    }
                    TaskKind::Input(_) => {
                        error!(task = id.as_u64(), "input task on background queue");
                    }
                }
            }
        }
    }

    fn take_input_line(&mut self, id: TaskId) -> Option<String> {
        match self.tasks.remove(&id)?.kind {
            TaskKind::Input(line) => Some(line),
            _ => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &mut self,
        id: TaskId,
        player: ObjId,
        work: Work,
        foreground: bool,
        world: &mut dyn WorldState,
        host: &mut dyn Host,
        natives: &NativeRegistry,
    ) {
        let ctx = if foreground {
            ExecCtx::new(self.options.fg_ticks, self.options.fg_seconds)
        } else {
            ExecCtx::new(self.options.bg_ticks, self.options.bg_seconds)
        };
        self.current = Some((id, player));
        let started = Instant::now();
        let result = {
            let mut interp = Interp::new(world, host, natives, self, ctx);
            match work {
                Work::Fresh(vm) => interp.run(vm),
                Work::Resume(snapshot, value) => interp.resume(snapshot, value),
            }
        };
        self.current = None;
        let elapsed = started.elapsed();
        if let Some(queue) = self.queues.get_mut(&player) {
            queue.usage += elapsed;
        }

        match result {
            Ok(TaskOutcome::Done(value)) => {
                trace!(task = id.as_u64(), %value, "task finished");
            }
            Ok(TaskOutcome::Aborted(reason)) => {
                debug!(task = id.as_u64(), ?reason, "task aborted");
            }
            Ok(TaskOutcome::Suspended(request)) => {
                self.park(id, player, *request);
            }
            Err(e) => {
                // A process-level fault kills the task, never the server.
                error!(task = id.as_u64(), %e, "task died on an internal fault");
            }
        }
    }

    fn park(&mut self, id: TaskId, player: ObjId, request: SuspendRequest) {
        let SuspendRequest { snapshot, wake } = request;
        let make_task = |kind| Task {
            id,
            player,
            kind,
            created: Instant::now(),
        };
        match wake {
            WakeCondition::Never => {
                self.tasks.insert(
                    id,
                    make_task(TaskKind::Suspended {
                        snapshot,
                        wake,
                        resume: None,
                    }),
                );
            }
            WakeCondition::Time(delay) => {
                self.tasks.insert(
                    id,
                    make_task(TaskKind::Suspended {
                        snapshot,
                        wake,
                        resume: None,
                    }),
                );
                self.insert_waiting(Instant::now() + delay, id);
            }
            WakeCondition::Input => {
                let queue = self.queue_mut(player);
                if queue.reading.is_some() {
                    // Only one reader per queue; wake the newcomer with an
                    // error instead of silently replacing the first.
                    self.tasks.insert(
                        id,
                        make_task(TaskKind::Suspended {
                            snapshot,
                            wake,
                            resume: Some(ResumeValue::Raise(Exception::new(ErrCode::E_INVARG))),
                        }),
                    );
                    self.queue_mut(player).background.push_back(id);
                } else {
                    queue.reading = Some(id);
                    self.tasks.insert(
                        id,
                        make_task(TaskKind::Suspended {
                            snapshot,
                            wake,
                            resume: None,
                        }),
                    );
                }
            }
        }
    }
}

impl SchedulerOps for Scheduler {
    fn current_task_id(&self) -> TaskId {
        self.current
            .map(|(id, _)| id)
            .unwrap_or_else(|| TaskId::from_u64(0))
    }

    fn fork_task(&mut self, frame: Activation, delay: Duration) -> Result<TaskId, ErrCode> {
        let player = frame.player;
        let background_count = self
            .tasks
            .values()
            .filter(|t| t.player == player && t.is_background())
            .count();
        let queue = self.queue_mut(player);
        if queue.bg_quota.is_some_and(|quota| background_count >= quota) {
            return Err(ErrCode::E_QUOTA);
        }
        let id = self.alloc_id();
        self.tasks.insert(
            id,
            Task {
                id,
                player,
                kind: TaskKind::Fork(Box::new(frame)),
                created: Instant::now(),
            },
        );
        if delay.is_zero() {
            self.queue_mut(player).background.push_back(id);
        } else {
            self.insert_waiting(Instant::now() + delay, id);
        }
        Ok(id)
    }

    fn kill_task(&mut self, id: TaskId, perms: ObjId) -> Result<(), ErrCode> {
        let task = self.tasks.get(&id).ok_or(ErrCode::E_INVARG)?;
        if task.player != perms {
            return Err(ErrCode::E_PERM);
        }
        let player = task.player;
        self.tasks.remove(&id);
        self.waiting.retain(|(_, t)| *t != id);
        if let Some(queue) = self.queues.get_mut(&player) {
            queue.remove(id);
        }
        Ok(())
    }

    fn resume_task(
        &mut self,
        id: TaskId,
        value: ResumeValue,
        perms: ObjId,
    ) -> Result<(), ErrCode> {
        let task = self.tasks.get_mut(&id).ok_or(ErrCode::E_INVARG)?;
        if task.player != perms {
            return Err(ErrCode::E_PERM);
        }
        let player = task.player;
        match &mut task.kind {
            TaskKind::Suspended {
                wake: WakeCondition::Input,
                ..
            } => Err(ErrCode::E_INVARG),
            TaskKind::Suspended { resume, .. } => {
                if resume.is_some() {
                    return Err(ErrCode::E_INVARG);
                }
                *resume = Some(value);
                self.waiting.retain(|(_, t)| *t != id);
                self.queue_mut(player).background.push_back(id);
                Ok(())
            }
            _ => Err(ErrCode::E_INVARG),
        }
    }

    fn queued_tasks(&self, perms: ObjId) -> List {
        let mut entries: Vec<_> = self
            .tasks
            .values()
            .filter(|t| t.player == perms)
            .collect();
        entries.sort_by_key(|t| t.id.as_u64());
        entries
            .into_iter()
            .map(|t| {
                let line = match &t.kind {
                    TaskKind::Suspended { snapshot, .. } => snapshot
                        .frames
                        .last()
                        .map(|f| f.line() as i64)
                        .unwrap_or(0),
                    _ => 0,
                };
                task_entry(t.id, t.player, t.state_name(), line)
            })
            .collect()
    }

    fn task_stack(&self, id: TaskId, perms: ObjId) -> Result<List, ErrCode> {
        let task = self.tasks.get(&id).ok_or(ErrCode::E_INVARG)?;
        if task.player != perms {
            return Err(ErrCode::E_PERM);
        }
        match &task.kind {
            TaskKind::Suspended { snapshot, .. } => Ok(snapshot.stack_listing()),
            _ => Err(ErrCode::E_INVARG),
        }
    }
}

//! Virtual machine: call stack, interpreter, unwinding, natives, snapshots

pub mod interpreter;
pub mod native;
pub mod suspend;
pub mod unwind;

pub use interpreter::Interp;
pub use native::{
    register_core_natives, NativeArgs, NativeFn, NativeOutcome, NativeRegistry, SchedulerOps,
};
pub use suspend::{ResumeValue, Snapshot};
pub use unwind::{Exception, Traceback, UnwindOutcome, UnwindReason};

use crate::activation::Activation;
use crate::var::{Map, Value};
use hearth_bytecode::VectorId;
use std::time::{Duration, Instant};

/// Default task recursion limit
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// Why a task was torn down instead of finishing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Tick budget exhausted
    Ticks,
    /// Wall-clock budget exhausted
    Seconds,
    /// Killed by request
    Kill,
    /// An exception escaped every frame
    Uncaught,
}

/// What a suspended task is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCondition {
    /// Only an explicit resume can wake it
    Never,
    /// Wake after this delay
    Time(Duration),
    /// Wake when a line of input arrives for its player
    Input,
}

/// Terminal state of one interpreter run
#[derive(Debug)]
pub enum TaskOutcome {
    /// The bottom frame returned normally
    Done(Value),
    /// The task was torn down
    Aborted(AbortReason),
    /// The task parked itself; the VM lives on inside the snapshot
    Suspended(Box<SuspendRequest>),
}

/// A parked task: its whole VM plus what wakes it
#[derive(Debug)]
pub struct SuspendRequest {
    /// Captured VM state
    pub snapshot: Snapshot,
    /// Wake condition chosen by the suspending native
    pub wake: WakeCondition,
}

/// One task's call stack
#[derive(Debug)]
pub struct Vm {
    /// Activations, bottom first; the last is current
    pub frames: Vec<Activation>,
    /// Recursion limit
    pub max_depth: usize,
    /// Which vector the bottom frame runs
    pub start_vector: VectorId,
    /// Small associative value that survives suspend/resume
    pub task_local: Value,
}

impl Vm {
    /// Create a VM with a single root frame
    pub fn new(root: Activation, max_depth: usize) -> Self {
        let start_vector = root.vector;
        Self {
            frames: vec![root],
            max_depth,
            start_vector,
            task_local: Value::Map(Map::new()),
        }
    }

    /// Current frame
    pub fn top(&self) -> &Activation {
        self.frames.last().expect("vm has no frames")
    }

    /// Current frame, mutably
    pub fn top_mut(&mut self) -> &mut Activation {
        self.frames.last_mut().expect("vm has no frames")
    }

    /// Call-stack depth
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Per-run execution budget and counters
///
/// Threaded explicitly through the interpreter; there is no global
/// interpreter state, so independent VMs can run in one process.
#[derive(Debug, Clone)]
pub struct ExecCtx {
    ticks_left: usize,
    deadline: Instant,
    ticks_used: usize,
    limit_fired: bool,
}

/// How many ticks pass between wall-clock checks
const TIME_CHECK_INTERVAL: usize = 1024;

/// Ticks granted once after a budget fires, so finally bodies reached by the
/// abort unwind still execute
const CLEANUP_RESERVE: usize = 2000;

impl ExecCtx {
    /// Budget of `ticks` ticks and `seconds` of wall-clock time
    pub fn new(ticks: usize, seconds: Duration) -> Self {
        Self {
            ticks_left: ticks,
            deadline: Instant::now() + seconds,
            ticks_used: 0,
            limit_fired: false,
        }
    }

    /// Consume one tick; `Some` when a budget ran out
    ///
    /// The first exhaustion grants [`CLEANUP_RESERVE`] further ticks so the
    /// ensuing abort can run finally handlers; exhausting the reserve aborts
    /// again with no new grant, which bounds total execution.
    #[inline]
    pub fn tick(&mut self) -> Option<AbortReason> {
        if self.ticks_left == 0 {
            if !self.limit_fired {
                self.limit_fired = true;
                self.ticks_left = CLEANUP_RESERVE;
            }
            return Some(AbortReason::Ticks);
        }
        self.ticks_left -= 1;
        self.ticks_used += 1;
        if !self.limit_fired
            && self.ticks_used % TIME_CHECK_INTERVAL == 0
            && Instant::now() >= self.deadline
        {
            self.limit_fired = true;
            self.ticks_left = self.ticks_left.min(CLEANUP_RESERVE);
            return Some(AbortReason::Seconds);
        }
        None
    }

    /// Remaining tick budget
    pub fn ticks_left(&self) -> usize {
        self.ticks_left
    }

    /// Remaining wall-clock budget
    pub fn seconds_left(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Ticks consumed so far
    pub fn ticks_used(&self) -> usize {
        self.ticks_used
    }
}

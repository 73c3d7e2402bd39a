//! Schedulable tasks
//!
//! A task is one independently schedulable unit of execution: a queued
//! input line awaiting command dispatch, a forked code vector with its
//! captured environment, or a suspended computation (a whole serialized VM
//! plus how it resumes).

use crate::activation::Activation;
use crate::var::ObjId;
use crate::vm::{ResumeValue, Snapshot, WakeCondition};
use std::time::Instant;

/// Unique identifier for a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Get the numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskId from a numeric value
    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

/// What kind of work a queued task holds
#[derive(Debug)]
pub enum TaskKind {
    /// One line of player input awaiting command dispatch
    Input(String),
    /// A forked code vector with its captured environment
    Fork(Box<Activation>),
    /// A parked computation
    Suspended {
        /// The whole captured VM
        snapshot: Snapshot,
        /// What it is waiting for
        wake: WakeCondition,
        /// Set once the task is ready: what to deliver at the suspension
        /// point
        resume: Option<ResumeValue>,
    },
}

/// One entry in the scheduler's task registry
#[derive(Debug)]
pub struct Task {
    /// Unique id
    pub id: TaskId,
    /// Owning principal
    pub player: ObjId,
    /// The work
    pub kind: TaskKind,
    /// When the task was created
    pub created: Instant,
}

impl Task {
    /// State name for introspection listings
    pub fn state_name(&self) -> &'static str {
        match &self.kind {
            TaskKind::Input(_) => "input",
            TaskKind::Fork(_) => "forked",
            TaskKind::Suspended { resume: Some(_), .. } => "ready",
            TaskKind::Suspended { wake, .. } => match wake {
                WakeCondition::Never => "suspended",
                WakeCondition::Time(_) => "waiting",
                WakeCondition::Input => "reading",
            },
        }
    }

    /// Whether this task counts against the owner's background quota
    pub fn is_background(&self) -> bool {
        !matches!(self.kind, TaskKind::Input(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frame_on;

    #[test]
    fn test_state_names() {
        let input = Task {
            id: TaskId::from_u64(1),
            player: ObjId(2),
            kind: TaskKind::Input("look".into()),
            created: Instant::now(),
        };
        assert_eq!(input.state_name(), "input");
        assert!(!input.is_background());

        let fork = Task {
            id: TaskId::from_u64(2),
            player: ObjId(2),
            kind: TaskKind::Fork(Box::new(frame_on("tick"))),
            created: Instant::now(),
        };
        assert_eq!(fork.state_name(), "forked");
        assert!(fork.is_background());
    }
}

//! Per-player task queues
//!
//! Each connected principal owns one queue with two sub-lists: sequenced
//! input lines (FIFO, flow-controlled by watermarks) and background work
//! (forked and now-ready suspended tasks, FIFO). The `usage` counter is the
//! inverted scheduling priority: it grows by wall-clock time consumed, and
//! the least-used active queue runs first.

use super::task::TaskId;
use crate::var::ObjId;
use std::collections::VecDeque;
use std::time::Duration;

/// One principal's task queue
#[derive(Debug)]
pub struct PlayerQueue {
    /// Owning principal
    pub player: ObjId,
    /// Sequenced input tasks, FIFO
    pub input: VecDeque<TaskId>,
    /// Forked and ready suspended tasks, FIFO
    pub background: VecDeque<TaskId>,
    /// Wall-clock time consumed; the scheduler's inverted priority
    pub usage: Duration,
    /// A task blocked in a read call, intercepting this queue's input
    pub reading: Option<TaskId>,
    /// Whether upstream input delivery is currently paused
    pub input_paused: bool,
    /// Whether the player is connected
    pub connected: bool,
    /// Cap on background tasks for this principal
    pub bg_quota: Option<usize>,
    /// Whether the queue was active in the previous scheduler pass
    pub was_active: bool,
}

impl PlayerQueue {
    /// Fresh queue for a principal
    pub fn new(player: ObjId, bg_quota: Option<usize>) -> Self {
        Self {
            player,
            input: VecDeque::new(),
            background: VecDeque::new(),
            usage: Duration::ZERO,
            reading: None,
            input_paused: false,
            connected: true,
            bg_quota,
            was_active: false,
        }
    }

    /// Whether the queue has a task the scheduler could run now
    pub fn has_ready(&self) -> bool {
        !self.input.is_empty() || !self.background.is_empty()
    }

    /// Whether the queue holds nothing at all
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.background.is_empty() && self.reading.is_none()
    }

    /// Drop a task id from wherever this queue references it
    pub fn remove(&mut self, id: TaskId) {
        self.input.retain(|t| *t != id);
        self.background.retain(|t| *t != id);
        if self.reading == Some(id) {
            self.reading = None;
        }
    }
}

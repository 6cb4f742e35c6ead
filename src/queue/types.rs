//! Messages and records exchanged with the queue coordinator.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::pipeline::Pipeline;

/// Immutable record of one finished pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskLog {
    /// The pipeline's command line, stages joined with ` | `
    pub command_line: String,
    pub stdout: String,
    pub stderr: String,
    /// Head exit code; `None` when the pipeline never ran to completion
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// How a task finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Counter snapshot taken atomically by the coordinator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub pending: usize,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Every submitted task is either in flight or accounted for
    pub fn is_consistent(&self) -> bool {
        self.in_flight + self.succeeded + self.failed == self.submitted
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Coordinator inbox messages, processed strictly one at a time
#[derive(Debug)]
pub enum QueueMessage {
    Submit(Pipeline),
    Fetch(oneshot::Sender<Option<Pipeline>>),
    Report { outcome: Outcome, log: TaskLog },
    IsIdle(oneshot::Sender<bool>),
    Stats(oneshot::Sender<QueueStats>),
    Logs {
        outcome: Outcome,
        reply: oneshot::Sender<Vec<TaskLog>>,
    },
    Shutdown,
}

//! Coordinator - the single owner of task queue state
//!
//! All queue state lives in one tokio task that consumes an inbox of
//! `QueueMessage`s in arrival order. Workers and callers only ever talk to
//! it through the channel, so enqueue, dequeue and accounting are totally
//! ordered without any locking.

use std::collections::VecDeque;
use std::io::Write;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;
use crate::queue::types::{Outcome, QueueMessage, QueueStats, TaskLog};

/// Queue state machine driven by `run`
pub struct Coordinator {
    pending: VecDeque<Pipeline>,
    submitted: u64,
    in_flight: u64,
    succeeded: u64,
    failed: u64,
    successes: Vec<TaskLog>,
    failures: Vec<TaskLog>,
    progress: bool,
    // A progress line is on screen and has not been terminated yet.
    progress_open: bool,
}

impl Coordinator {
    pub fn new(progress: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            submitted: 0,
            in_flight: 0,
            succeeded: 0,
            failed: 0,
            successes: Vec::new(),
            failures: Vec::new(),
            progress,
            progress_open: false,
        }
    }

    /// Process messages until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<QueueMessage>) {
        info!("Task queue coordinator started");

        while let Some(message) = inbox.recv().await {
            if !self.handle(message) {
                break;
            }
        }

        if !self.pending.is_empty() {
            warn!(dropped = self.pending.len(), "Coordinator stopped with pending tasks");
        }
        info!(
            succeeded = self.succeeded,
            failed = self.failed,
            "Task queue coordinator stopped"
        );
    }

    /// Apply one message. Returns false when the coordinator should stop.
    pub fn handle(&mut self, message: QueueMessage) -> bool {
        match message {
            QueueMessage::Submit(pipeline) => {
                debug!(command = %pipeline.command_line(), "Task submitted");
                self.pending.push_back(pipeline);
                self.submitted += 1;
                self.in_flight += 1;
            }
            QueueMessage::Fetch(reply) => {
                let next = self.pending.pop_front();
                if let Err(Some(unclaimed)) = reply.send(next) {
                    // The worker went away between asking and receiving.
                    self.pending.push_front(unclaimed);
                }
            }
            QueueMessage::Report { outcome, log } => self.record(outcome, log),
            QueueMessage::IsIdle(reply) => {
                let idle = self.in_flight == 0;
                if idle {
                    self.finish_progress();
                }
                let _ = reply.send(idle);
            }
            QueueMessage::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            QueueMessage::Logs { outcome, reply } => {
                let logs = match outcome {
                    Outcome::Success => self.successes.clone(),
                    Outcome::Failure => self.failures.clone(),
                };
                let _ = reply.send(logs);
            }
            QueueMessage::Shutdown => return false,
        }
        true
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted,
            pending: self.pending.len(),
            in_flight: self.in_flight,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }

    fn record(&mut self, outcome: Outcome, log: TaskLog) {
        if self.in_flight == 0 {
            warn!(command = %log.command_line, "Ignoring report with no task in flight");
            return;
        }

        self.in_flight -= 1;
        match outcome {
            Outcome::Success => {
                debug!(command = %log.command_line, "Task succeeded");
                self.succeeded += 1;
                self.successes.push(log);
            }
            Outcome::Failure => {
                debug!(
                    command = %log.command_line,
                    exit_code = ?log.exit_code,
                    "Task failed"
                );
                self.failed += 1;
                self.failures.push(log);
            }
        }
        self.print_progress();
    }

    fn print_progress(&mut self) {
        if !self.progress {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{},{}", self.succeeded, self.failed);
        let _ = stderr.flush();
        self.progress_open = true;
    }

    fn finish_progress(&mut self) {
        if self.progress_open {
            let _ = writeln!(std::io::stderr());
            self.progress_open = false;
            info!(
                succeeded = self.succeeded,
                failed = self.failed,
                "Task queue idle"
            );
        }
    }
}

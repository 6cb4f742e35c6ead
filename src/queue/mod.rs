//! Bounded-parallelism task queue for independent pipelines.
//!
//! A `TaskQueue` spawns one coordinator task owning all queue state and a
//! fixed pool of workers. Every interaction is a message to the coordinator.

pub mod coordinator;
pub mod types;
pub mod worker;

pub use coordinator::Coordinator;
pub use types::{Outcome, QueueMessage, QueueStats, TaskLog};
pub use worker::WorkerSettings;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::core::config::QueueConfig;
use crate::core::errors::{PipeError, Result};
use crate::pipeline::Pipeline;

/// Handle to a running task queue
pub struct TaskQueue {
    inbox: mpsc::UnboundedSender<QueueMessage>,
    config: QueueConfig,
    coordinator: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskQueue {
    /// Queue with one worker per available CPU. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Self {
        Self::spawn(QueueConfig::default())
    }

    /// Queue with a worker pool size override
    pub fn with_workers(workers: usize) -> Result<Self> {
        Self::with_config(QueueConfig {
            workers,
            ..Default::default()
        })
    }

    pub fn with_config(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::spawn(config))
    }

    fn spawn(config: QueueConfig) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let coordinator = tokio::spawn(Coordinator::new(config.progress).run(rx));

        let settings = WorkerSettings {
            idle_backoff: config.idle_backoff,
            chunk_size: config.chunk_size,
        };
        let workers = (0..config.workers)
            .map(|id| tokio::spawn(worker::run_worker(id, inbox.clone(), settings)))
            .collect();

        info!(workers = config.workers, "Task queue started");

        Self {
            inbox,
            config,
            coordinator: Some(coordinator),
            workers,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Submit a pipeline (or a single command) for execution. Returns
    /// immediately.
    pub fn add_task(&self, task: impl Into<Pipeline>) -> Result<()> {
        self.inbox.send(QueueMessage::Submit(task.into()))?;
        Ok(())
    }

    /// Block until no submitted task is in flight.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let (tx, rx) = oneshot::channel();
            self.inbox.send(QueueMessage::IsIdle(tx))?;
            if rx.await? {
                return Ok(());
            }
            sleep(self.config.wait_poll_interval).await;
        }
    }

    /// Logs of tasks whose head exited with code 0, in completion order
    pub async fn outputs(&self) -> Result<Vec<TaskLog>> {
        self.logs(Outcome::Success).await
    }

    /// Logs of failed tasks, in completion order
    pub async fn errors(&self) -> Result<Vec<TaskLog>> {
        self.logs(Outcome::Failure).await
    }

    async fn logs(&self, outcome: Outcome) -> Result<Vec<TaskLog>> {
        let (reply, rx) = oneshot::channel();
        self.inbox.send(QueueMessage::Logs { outcome, reply })?;
        Ok(rx.await?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(QueueMessage::Stats(tx))?;
        Ok(rx.await?)
    }

    /// Stop the coordinator and wait for workers to finish their current
    /// task. Pending tasks are dropped.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.inbox.send(QueueMessage::Shutdown);

        if let Some(coordinator) = self.coordinator.take() {
            coordinator
                .await
                .map_err(|e| PipeError::TaskPanicked(e.to_string()))?;
        }
        for result in join_all(std::mem::take(&mut self.workers)).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        Ok(())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let _ = self.inbox.send(QueueMessage::Shutdown);
    }
}

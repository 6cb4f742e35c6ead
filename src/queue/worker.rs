//! Worker loop: fetch a pipeline, run it, report the outcome.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::core::errors::Result;
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::queue::types::{Outcome, QueueMessage, TaskLog};

/// Settings a worker needs from the queue configuration
#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub idle_backoff: Duration,
    pub chunk_size: usize,
}

/// Run until the coordinator stops answering.
pub async fn run_worker(
    id: usize,
    inbox: mpsc::UnboundedSender<QueueMessage>,
    settings: WorkerSettings,
) {
    debug!(worker = id, "Worker started");

    loop {
        let (reply_tx, reply_rx) = oneshot::channel();
        if inbox.send(QueueMessage::Fetch(reply_tx)).is_err() {
            break;
        }
        let pipeline = match reply_rx.await {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => {
                sleep(settings.idle_backoff).await;
                continue;
            }
            Err(_) => break,
        };

        let (outcome, log) = execute(id, pipeline, settings.chunk_size).await;
        if inbox.send(QueueMessage::Report { outcome, log }).is_err() {
            break;
        }
    }

    debug!(worker = id, "Worker stopped");
}

/// Run one pipeline to completion and classify it. Never fails: spawn
/// errors and panics become failure logs.
pub async fn execute(worker: usize, mut pipeline: Pipeline, chunk_size: usize) -> (Outcome, TaskLog) {
    let command_line = pipeline.command_line();
    let started = Instant::now();
    pipeline.set_chunk_size(chunk_size);

    debug!(worker, command = %command_line, "Running task");

    // A separate task turns a panic inside the pipeline into a JoinError.
    let result = tokio::spawn(async move { pipeline.run().await }).await;
    classify(worker, command_line, result, started.elapsed())
}

/// Turn the joined result of a pipeline task into its outcome and log.
fn classify(
    worker: usize,
    command_line: String,
    result: std::result::Result<Result<PipelineOutput>, JoinError>,
    elapsed: Duration,
) -> (Outcome, TaskLog) {
    match result {
        Ok(Ok(output)) => {
            let outcome = if output.success() {
                Outcome::Success
            } else {
                Outcome::Failure
            };
            let log = TaskLog {
                command_line,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: Some(output.exit_code),
                elapsed,
            };
            (outcome, log)
        }
        Ok(Err(e)) => {
            error!(worker, command = %command_line, error = %e, category = e.category(), "Task could not run");
            (Outcome::Failure, failure_log(command_line, e.to_string(), elapsed))
        }
        Err(join_error) => {
            error!(worker, command = %command_line, error = %join_error, "Task panicked");
            (
                Outcome::Failure,
                failure_log(command_line, join_error.to_string(), elapsed),
            )
        }
    }
}

fn failure_log(command_line: String, description: String, elapsed: Duration) -> TaskLog {
    TaskLog {
        command_line,
        stdout: String::new(),
        stderr: description,
        exit_code: None,
        elapsed,
    }
}

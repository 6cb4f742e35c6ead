//! Process pipelines: linear chains of commands where each stage's stdin is
//! the previous stage's stdout.
//!
//! Stages are streamed concurrently. Relays always drain process output into
//! in-memory queues, so no stage can block on a full OS pipe; the flip side
//! is that every stage's stdout and the shared stderr stay in memory until
//! the pipeline is dropped.

pub mod buffer;
pub mod command;
pub mod relay;

pub use buffer::{ByteCursor, ByteQueue};
pub use command::{Command, PipelineOutput, SIGNAL_EXIT_CODE};

use tracing::{debug, warn};

use crate::core::errors::{PipeError, Result};

/// Ordered chain of commands. Stage `i` reads from stage `i - 1`; the last
/// stage is the head whose output the pipeline reports.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Command>,
}

impl Pipeline {
    pub fn new(first: Command) -> Self {
        Self {
            stages: vec![first],
        }
    }

    /// Append `downstream`, reading from the current head.
    pub fn pipe(mut self, downstream: Command) -> Result<Self> {
        self.connect(downstream)?;
        Ok(self)
    }

    /// In-place form of `pipe`. Fails with `InvalidState` if any stage has
    /// started or `downstream` is already connected elsewhere.
    pub fn connect(&mut self, mut downstream: Command) -> Result<()> {
        if let Some(started) = self.stages.iter().find(|c| c.is_started()) {
            return Err(PipeError::invalid_state(format!(
                "cannot extend pipeline: '{}' has already started",
                started.program()
            )));
        }

        let head = self.head_mut();
        downstream.connect(head)?;

        // Earlier stages still point at the old head's stderr sink.
        let sink = downstream.stderr_sink().clone();
        for stage in &mut self.stages {
            stage.share_stderr(&sink);
        }
        self.stages.push(downstream);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Command] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&Command> {
        self.stages.get(index)
    }

    pub fn head(&self) -> &Command {
        // A pipeline is never constructed without a stage.
        &self.stages[self.stages.len() - 1]
    }

    fn head_mut(&mut self) -> &mut Command {
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        for stage in &mut self.stages {
            stage.set_chunk_size(chunk_size);
        }
    }

    /// Stages joined with ` | `, arguments quoted
    pub fn command_line(&self) -> String {
        self.stages
            .iter()
            .map(Command::command_line)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.head().exit_code()
    }

    pub fn read_stdout(&self) -> String {
        self.head().read_stdout()
    }

    pub fn read_stderr(&self) -> String {
        self.head().read_stderr()
    }

    /// Start every stage, upstream first, without waiting for any of them.
    ///
    /// If a stage fails to spawn, the stages before it are already running
    /// and have lost their reader; `wait` still reaps them.
    pub fn start(&mut self) -> Result<()> {
        let head = self.stages.len() - 1;
        self.start_stage(head)
    }

    fn start_stage(&mut self, index: usize) -> Result<()> {
        if index > 0 {
            self.start_stage(index - 1)?;
        }
        debug!(stage = index, program = %self.stages[index].program(), "starting pipeline stage");
        self.stages[index].start()
    }

    /// Wait for every stage. Returns the head's output; the first stage
    /// error is returned after all stages have been waited on.
    pub async fn wait(&mut self) -> Result<PipelineOutput> {
        let mut first_error = None;
        let mut head_code = None;
        let last = self.stages.len() - 1;

        for (index, stage) in self.stages.iter_mut().enumerate() {
            match stage.wait().await {
                Ok(code) if index == last => head_code = Some(code),
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        let exit_code = head_code
            .ok_or_else(|| PipeError::invalid_state("pipeline head produced no exit code"))?;

        Ok(PipelineOutput {
            stdout: self.read_stdout(),
            stderr: self.read_stderr(),
            exit_code,
        })
    }

    /// Start the pipeline and wait for all stages to finish. A start error is
    /// returned only after every stage that did start has exited.
    pub async fn run(&mut self) -> Result<PipelineOutput> {
        if let Err(e) = self.start() {
            self.reap_started().await;
            return Err(e);
        }
        self.wait().await
    }

    async fn reap_started(&mut self) {
        for stage in self.stages.iter_mut() {
            if !stage.is_started() || stage.is_finished() {
                continue;
            }
            if let Err(e) = stage.wait().await {
                warn!(program = %stage.program(), error = %e, "stage failed after pipeline start error");
            }
        }
    }
}

impl From<Command> for Pipeline {
    fn from(command: Command) -> Self {
        Pipeline::new(command)
    }
}

impl Command {
    /// Start a pipeline with this command feeding `downstream`.
    pub fn pipe(self, downstream: Command) -> Result<Pipeline> {
        Pipeline::new(self).pipe(downstream)
    }
}

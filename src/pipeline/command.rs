//! A single process invocation and its place in a pipeline.

use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::errors::{PipeError, Result};
use crate::pipeline::buffer::ByteQueue;
use crate::pipeline::relay::{self, DEFAULT_CHUNK_SIZE};

/// Exit code recorded when a process was terminated by a signal
pub const SIGNAL_EXIT_CODE: i32 = -1;

#[derive(Debug)]
enum CommandState {
    Pending,
    Running(JoinHandle<Result<i32>>),
    Finished,
}

/// Captured result of a finished command or pipeline head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl PipelineOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `PipeError::NonZeroExit`
    pub fn ensure_success(self, command: impl Into<String>) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(PipeError::NonZeroExit {
                command: command.into(),
                code: self.exit_code,
            })
        }
    }
}

/// An external program with its arguments and captured streams.
///
/// Nothing is spawned until `start` or `run`. A command executes at most
/// once; afterwards its exit code and captured output stay readable.
#[derive(Debug)]
pub struct Command {
    program: String,
    args: Vec<String>,
    stdin: Option<ByteQueue>,
    stdout: ByteQueue,
    stderr: ByteQueue,
    tag_stderr: bool,
    chunk_size: usize,
    exit_code: Arc<OnceLock<i32>>,
    state: CommandState,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            stdout: ByteQueue::new(),
            stderr: ByteQueue::new(),
            tag_stderr: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exit_code: Arc::new(OnceLock::new()),
            state: CommandState::Pending,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    /// Display form with every argument single-quoted, e.g. `echo 'a b'`
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(quote_program(&self.program));
        parts.extend(self.args.iter().map(|a| quote_sh(a)));
        parts.join(" ")
    }

    /// Exit code, set once the process has been waited on
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn has_upstream(&self) -> bool {
        self.stdin.is_some()
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.state, CommandState::Pending)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, CommandState::Finished)
    }

    /// Everything this command has written to stdout so far
    pub fn read_stdout(&self) -> String {
        self.stdout.read_text()
    }

    /// Everything written to this command's stderr sink so far. When the
    /// command is part of a pipeline the sink is shared by all stages.
    pub fn read_stderr(&self) -> String {
        self.stderr.read_text()
    }

    pub(crate) fn stderr_sink(&self) -> &ByteQueue {
        &self.stderr
    }

    pub(crate) fn share_stderr(&mut self, sink: &ByteQueue) {
        self.stderr = sink.clone();
        self.tag_stderr = true;
    }

    /// Feed `upstream`'s stdout into this command's stdin.
    ///
    /// Both commands must still be pending and this command must not already
    /// have an upstream. Only `upstream`'s stderr is redirected into this
    /// command's sink, so chains are built through `Pipeline`, which repoints
    /// every earlier stage as well.
    pub(crate) fn connect(&mut self, upstream: &mut Command) -> Result<()> {
        if self.is_started() || upstream.is_started() {
            return Err(PipeError::invalid_state(format!(
                "cannot connect '{}' to '{}' after execution has started",
                upstream.program, self.program
            )));
        }
        if self.stdin.is_some() {
            return Err(PipeError::invalid_state(format!(
                "'{}' already has an upstream command",
                self.program
            )));
        }

        self.stdin = Some(upstream.stdout.clone());
        upstream.share_stderr(&self.stderr);
        self.tag_stderr = true;
        Ok(())
    }

    /// Spawn the process and its relays without waiting for it.
    ///
    /// Must be called within a tokio runtime. A connected command requires
    /// its upstream to have been started; it reads input as the upstream
    /// produces it and closes stdin once the upstream's stdout ends.
    pub fn start(&mut self) -> Result<()> {
        if self.is_started() {
            return Err(PipeError::invalid_state(format!(
                "'{}' has already been executed",
                self.program
            )));
        }
        if let Some(upstream) = &self.stdin {
            if !upstream.is_opened() {
                return Err(PipeError::invalid_state(format!(
                    "'{}' cannot start before its upstream",
                    self.program
                )));
            }
        }
        self.stdout.open();

        let mut process = tokio::process::Command::new(&self.program);
        process
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Terminal without an exit code; downstream readers see EOF
                // and the upstream loses its reader.
                self.state = CommandState::Finished;
                self.stdout.close();
                if let Some(upstream) = &self.stdin {
                    upstream.detach_reader();
                }
                return Err(PipeError::process_failure(self.program.clone(), e));
            }
        };

        let pid = child.id();
        debug!(program = %self.program, pid = ?pid, "spawned process");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let upstream = self.stdin.clone();
        let cursor = upstream.as_ref().map(ByteQueue::cursor);

        let program = self.program.clone();
        let stdout_sink = self.stdout.clone();
        let stderr_sink = self.stderr.clone();
        let tag_stderr = self.tag_stderr;
        let chunk_size = self.chunk_size;
        let exit_cell = self.exit_code.clone();

        let handle = tokio::spawn(async move {
            let feeder = match (stdin, cursor) {
                (Some(stdin), Some(cursor)) => Some(tokio::spawn(relay::feed(stdin, cursor))),
                _ => None,
            };

            let tag = tag_stderr.then_some(program.as_str());
            let (out, err) = tokio::join!(
                async {
                    match stdout {
                        Some(stdout) => relay::drain(stdout, &stdout_sink, chunk_size, None).await,
                        None => Ok(0),
                    }
                },
                async {
                    match stderr {
                        Some(stderr) => relay::drain(stderr, &stderr_sink, chunk_size, tag).await,
                        None => Ok(0),
                    }
                },
            );
            stdout_sink.close();

            let status = child
                .wait()
                .await
                .map_err(|e| PipeError::io(format!("wait for '{}'", program), e));

            // The process no longer reads stdin. Stop the upstream's relay
            // so a producer that keeps writing gets a broken pipe.
            if let Some(upstream) = &upstream {
                upstream.detach_reader();
            }
            if let Some(feeder) = feeder {
                if !feeder.is_finished() {
                    feeder.abort();
                }
                match feeder.await {
                    Ok(Err(e)) => warn!(program = %program, error = %e, "stdin relay failed"),
                    Ok(Ok(_)) => {}
                    Err(_) => {}
                }
            }

            let code = status?.code().unwrap_or(SIGNAL_EXIT_CODE);
            let _ = exit_cell.set(code);
            debug!(program = %program, pid = ?pid, exit_code = code, "process exited");

            out?;
            err?;
            Ok(code)
        });

        self.state = CommandState::Running(handle);
        Ok(())
    }

    /// Wait for a started command to exit and return its exit code.
    pub async fn wait(&mut self) -> Result<i32> {
        match std::mem::replace(&mut self.state, CommandState::Finished) {
            CommandState::Pending => {
                self.state = CommandState::Pending;
                Err(PipeError::invalid_state(format!(
                    "'{}' has not been started",
                    self.program
                )))
            }
            CommandState::Running(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipeError::TaskPanicked(e.to_string())),
            },
            CommandState::Finished => self.exit_code().ok_or_else(|| {
                PipeError::invalid_state(format!("'{}' never produced an exit code", self.program))
            }),
        }
    }

    /// Start the command and wait for it to finish.
    pub async fn run(&mut self) -> Result<PipelineOutput> {
        self.start()?;
        let exit_code = self.wait().await?;
        Ok(PipelineOutput {
            stdout: self.read_stdout(),
            stderr: self.read_stderr(),
            exit_code,
        })
    }
}

fn quote_program(p: &str) -> String {
    if !p.is_empty() && is_simple_word(p) {
        p.to_string()
    } else {
        quote_sh(p)
    }
}

fn is_simple_word(s: &str) -> bool {
    s.chars().all(|c| {
        matches!(c,
        'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' | '/' | ':' | '+' | '%' | '@' | '=' | ',')
    })
}

pub(crate) fn quote_sh(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let escaped = s.replace('\'', "'\"'\"'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quote_sh() {
        assert_eq!(quote_sh(""), "''");
        assert_eq!(quote_sh("hello"), "'hello'");
        assert_eq!(quote_sh("hello world"), "'hello world'");
        assert_eq!(quote_sh("foo'bar"), "'foo'\"'\"'bar'");
    }

    #[test]
    fn test_command_line() {
        let cmd = Command::new("echo").arg("a b").arg("it's");
        assert_eq!(cmd.command_line(), "echo 'a b' 'it'\"'\"'s'");

        let cmd = Command::new("/opt/my tools/run");
        assert_eq!(cmd.command_line(), "'/opt/my tools/run'");
    }

    #[test]
    fn test_read_before_run_is_empty() {
        let cmd = Command::new("echo").arg("hi");
        assert_eq!(cmd.read_stdout(), "");
        assert_eq!(cmd.read_stderr(), "");
        assert_eq!(cmd.exit_code(), None);
        assert!(!cmd.is_started());
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let mut a = Command::new("echo");
        let mut b = Command::new("cat");
        let mut c = Command::new("sort");

        c.connect(&mut a).unwrap();
        assert!(c.has_upstream());
        assert!(a.stderr_sink().same_queue(c.stderr_sink()));

        let err = c.connect(&mut b).unwrap_err();
        assert!(matches!(err, PipeError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_run_echo() {
        let mut cmd = Command::new("echo").arg("hi");
        let output = cmd.run().await.unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "");
        assert_eq!(cmd.exit_code(), Some(0));
        assert!(cmd.is_finished());
    }

    #[tokio::test]
    async fn test_rerun_is_invalid_state() {
        let mut cmd = Command::new("true");
        cmd.run().await.unwrap();

        let err = cmd.run().await.unwrap_err();
        assert!(matches!(err, PipeError::InvalidState { .. }));
        // The first result stays readable.
        assert_eq!(cmd.exit_code(), Some(0));
        assert_eq!(cmd.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_after_start_is_invalid_state() {
        let mut up = Command::new("true");
        up.run().await.unwrap();

        let mut down = Command::new("cat");
        let err = down.connect(&mut up).unwrap_err();
        assert!(matches!(err, PipeError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_process_failure() {
        let mut cmd = Command::new("/nonexistent/definitely-not-here");
        let err = cmd.run().await.unwrap_err();

        assert!(matches!(err, PipeError::ProcessFailure { .. }));
        assert!(cmd.is_finished());
        assert_eq!(cmd.exit_code(), None);
    }

    #[tokio::test]
    async fn test_wait_before_start_is_invalid_state() {
        let mut cmd = Command::new("true");
        let err = cmd.wait().await.unwrap_err();
        assert!(matches!(err, PipeError::InvalidState { .. }));
        assert!(!cmd.is_started());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let mut cmd = Command::new("sh").args(["-c", "echo bad >&2; exit 3"]);
        let output = cmd.run().await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr, "bad\n");
        assert!(!output.success());
        let err = output.ensure_success(cmd.command_line()).unwrap_err();
        assert!(matches!(err, PipeError::NonZeroExit { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_exit_detaches_upstream_reader() {
        let mut up = Command::new("printf").arg("x");
        let mut down = Command::new("true");
        down.connect(&mut up).unwrap();

        up.start().unwrap();
        down.start().unwrap();
        assert_eq!(down.wait().await.unwrap(), 0);
        assert!(up.stdout.is_reader_detached());
        up.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_detaches_upstream_reader() {
        let mut up = Command::new("true");
        let mut down = Command::new("/nonexistent/consumer");
        down.connect(&mut up).unwrap();

        up.start().unwrap();
        let err = down.start().unwrap_err();
        assert!(matches!(err, PipeError::ProcessFailure { .. }));
        assert!(up.stdout.is_reader_detached());
        assert_eq!(up.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_fire_and_continue() {
        let mut up = Command::new("printf").arg("b\\na\\n");
        let mut down = Command::new("sort");
        down.connect(&mut up).unwrap();

        let err = down.start().unwrap_err();
        assert!(matches!(err, PipeError::InvalidState { .. }));
        assert!(!down.is_started());

        // Neither is awaited before the other starts.
        up.start().unwrap();
        down.start().unwrap();

        assert_eq!(down.wait().await.unwrap(), 0);
        assert_eq!(up.wait().await.unwrap(), 0);
        assert_eq!(down.read_stdout(), "a\nb\n");
        assert_eq!(up.read_stdout(), "b\na\n");
    }
}

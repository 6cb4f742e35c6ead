use thiserror::Error;

/// Unified error type for pipeline execution and the task queue
#[derive(Debug, Error)]
pub enum PipeError {
    /// The OS could not spawn the executable
    #[error("Failed to spawn process '{program}': {source}")]
    ProcessFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process ran but exited with a non-zero code
    #[error("Command '{command}' exited with code {code}")]
    NonZeroExit { command: String, code: i32 },

    /// Command lifecycle violations (double execute, connect after start)
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Relay I/O failures
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The queue coordinator is no longer running
    #[error("Task queue is closed")]
    QueueClosed,

    /// A pipeline task panicked inside a worker
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

impl PipeError {
    /// Create a spawn failure for the given program
    pub fn process_failure<S: Into<String>>(program: S, source: std::io::Error) -> Self {
        Self::ProcessFailure {
            program: program.into(),
            source,
        }
    }

    /// Create a lifecycle violation error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ProcessFailure { .. } => "process",
            Self::NonZeroExit { .. } => "exit",
            Self::InvalidState { .. } => "state",
            Self::Io { .. } => "io",
            Self::Configuration(_) => "configuration",
            Self::QueueClosed => "channel",
            Self::TaskPanicked(_) => "panic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PipeError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PipeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PipeError::QueueClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for PipeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        PipeError::QueueClosed
    }
}

impl From<serde_yaml::Error> for PipeError {
    fn from(err: serde_yaml::Error) -> Self {
        PipeError::Configuration(err.to_string())
    }
}

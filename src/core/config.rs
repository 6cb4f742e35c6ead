use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{PipeError, Result};

/// Task queue configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of long-lived workers pulling pipelines from the queue
    pub workers: usize,
    /// How long an idle worker sleeps before asking for work again
    pub idle_backoff: Duration,
    /// How often `TaskQueue::wait` asks the coordinator whether it is idle
    pub wait_poll_interval: Duration,
    /// Maximum bytes read from a process stream in one relay step
    pub chunk_size: usize,
    /// Write the `succeeded,failed` progress line to stderr
    pub progress: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            idle_backoff: Duration::from_millis(5),
            wait_poll_interval: Duration::from_millis(10),
            chunk_size: 8 * 1024,
            progress: true,
        }
    }
}

impl QueueConfig {
    /// Create a new builder for QueueConfig
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipeError::configuration("workers must be greater than 0"));
        }
        if self.chunk_size == 0 {
            return Err(PipeError::configuration("chunk_size must be greater than 0"));
        }
        if self.wait_poll_interval.is_zero() {
            return Err(PipeError::configuration(
                "wait_poll_interval must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Small, quiet configuration for development and tests
    pub fn development() -> Self {
        Self {
            workers: 4,
            idle_backoff: Duration::from_millis(1),
            wait_poll_interval: Duration::from_millis(5),
            progress: false,
            ..Default::default()
        }
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipeError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&text)
    }
}

/// Builder for QueueConfig
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: QueueConfig::default(),
        }
    }

    /// Set the worker pool size
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the idle worker backoff
    pub fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.config.idle_backoff = backoff;
        self
    }

    /// Set the wait polling interval
    pub fn wait_poll_interval(mut self, interval: Duration) -> Self {
        self.config.wait_poll_interval = interval;
        self
    }

    /// Set the relay chunk size
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    /// Enable/disable the progress line
    pub fn progress(mut self, enabled: bool) -> Self {
        self.config.progress = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<QueueConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for QueueConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, num_cpus::get());
        assert!(config.progress);
    }

    #[test]
    fn test_development_config() {
        let config = QueueConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 4);
        assert!(!config.progress);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = QueueConfig::default();

        config.workers = 0;
        assert!(config.validate().is_err());
        config.workers = 2;

        config.chunk_size = 0;
        assert!(config.validate().is_err());
        config.chunk_size = 1024;

        config.wait_poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = QueueConfig::builder()
            .workers(3)
            .chunk_size(512)
            .idle_backoff(Duration::from_millis(2))
            .progress(false)
            .build()
            .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.idle_backoff, Duration::from_millis(2));
        assert!(!config.progress);
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = QueueConfig::from_yaml_str("workers: 7\nprogress: false\n").unwrap();
        assert_eq!(config.workers, 7);
        assert!(!config.progress);
        assert_eq!(config.chunk_size, QueueConfig::default().chunk_size);
    }

    #[test]
    fn test_yaml_invalid() {
        assert!(QueueConfig::from_yaml_str("workers: 0\n").is_err());
        assert!(QueueConfig::from_yaml_str("workers: [nope]\n").is_err());
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers: 2\nchunk_size: 64").unwrap();

        let config = QueueConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.chunk_size, 64);
    }
}

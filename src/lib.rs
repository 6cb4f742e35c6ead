// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

// Process pipelines and the task queue that runs them
pub mod pipeline;
pub mod queue;

// Re-exports for convenience
pub use core::config::{QueueConfig, QueueConfigBuilder};
pub use core::errors::{PipeError, Result};
pub use pipeline::{ByteQueue, Command, Pipeline, PipelineOutput};
pub use queue::{QueueStats, TaskLog, TaskQueue};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_queue() {
        let queue = TaskQueue::with_config(QueueConfig::development()).unwrap();

        queue.add_task(Command::new("echo").arg("hello")).unwrap();
        queue
            .add_task(Command::new("printf").arg("b\\na\\n").pipe(Command::new("sort")).unwrap())
            .unwrap();
        queue.wait().await.unwrap();

        let mut outputs: Vec<String> = queue
            .outputs()
            .await
            .unwrap()
            .into_iter()
            .map(|log| log.stdout)
            .collect();
        outputs.sort();
        assert_eq!(outputs, vec!["a\nb\n".to_string(), "hello\n".to_string()]);
        assert!(queue.errors().await.unwrap().is_empty());

        queue.shutdown().await.unwrap();
    }
}

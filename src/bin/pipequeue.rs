//! Run the pipelines listed in a YAML job file on a task queue.
//!
//! ```yaml
//! queue:
//!   workers: 4
//! jobs:
//!   - - program: printf
//!       args: ["b\\na\\n"]
//!     - program: sort
//!   - - program: echo
//!       args: ["hello world"]
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pipequeue::{Command, Pipeline, QueueConfig, TaskQueue};
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipequeue")]
#[command(about = "Run process pipelines concurrently on a bounded worker pool")]
#[command(version)]
struct Cli {
    /// Job file listing the pipelines to run
    #[arg(value_name = "FILE")]
    jobs: PathBuf,

    /// Worker pool size, overriding the job file
    #[arg(short, long)]
    workers: Option<usize>,

    /// Print captured stdout of successful tasks
    #[arg(long)]
    show_output: bool,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default)]
    queue: QueueConfig,
    jobs: Vec<Vec<StageSpec>>,
}

#[derive(Debug, Deserialize)]
struct StageSpec {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

fn build_pipeline(stages: Vec<StageSpec>) -> Result<Pipeline> {
    let mut stages = stages.into_iter();
    let Some(first) = stages.next() else {
        bail!("job has no stages");
    };
    let mut pipeline = Pipeline::new(Command::new(first.program).args(first.args));
    for stage in stages {
        pipeline.connect(Command::new(stage.program).args(stage.args))?;
    }
    Ok(pipeline)
}

async fn run(cli: Cli) -> Result<bool> {
    let text = std::fs::read_to_string(&cli.jobs)
        .with_context(|| format!("reading {}", cli.jobs.display()))?;
    let mut file: JobFile = serde_yaml::from_str(&text).context("parsing job file")?;
    if let Some(workers) = cli.workers {
        file.queue.workers = workers;
    }

    let queue = TaskQueue::with_config(file.queue)?;
    let total = file.jobs.len();
    for (index, stages) in file.jobs.into_iter().enumerate() {
        let pipeline = build_pipeline(stages).with_context(|| format!("job #{}", index))?;
        queue.add_task(pipeline)?;
    }
    info!(jobs = total, "Submitted all jobs");

    queue.wait().await?;

    let outputs = queue.outputs().await?;
    let errors = queue.errors().await?;
    if cli.show_output {
        for log in &outputs {
            println!("$ {}\n{}", log.command_line, log.stdout);
        }
    }
    for log in &errors {
        eprintln!("FAILED ({:?}): {}\n{}", log.exit_code, log.command_line, log.stderr);
    }
    println!("{} succeeded, {} failed", outputs.len(), errors.len());

    queue.shutdown().await?;
    Ok(errors.is_empty())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("pipequeue failed: {:#}", e);
            process::exit(2);
        }
    }
}

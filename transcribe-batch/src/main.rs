use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info, warn};

use transcribe_batch::{
    BatchConfig, BatchOrchestrator, BatchStats, CheckpointStore, FileValidator, JobFn,
    ProgressCallback, ResourceMonitor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable batch transcription runner", long_about = None)]
struct Cli {
    #[arg(long, global = true, help = "JSON config file; missing fields use defaults")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Checkpoint directory (overrides the config file)")]
    checkpoint_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the batch that can be resumed, if any
    ResumeInfo,
    /// Delete the checkpoint
    Clear,
    /// Check FILES in a batch run without transcribing them
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long, help = "Resume or name this batch")]
    batch_id: Option<String>,

    #[arg(long, help = "Maximum parallel workers")]
    workers: Option<usize>,

    #[arg(long, help = "Reject files larger than this")]
    max_file_size_mb: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => BatchConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BatchConfig::default(),
    };
    if let Some(dir) = cli.checkpoint_dir {
        config.checkpoint_dir = Some(dir);
    }

    match cli.command {
        Command::ResumeInfo => {
            let store = CheckpointStore::from_config(&config);
            match store.resume_info() {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => println!("No resumable batch in {}", store.dir().display()),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear => {
            let store = CheckpointStore::from_config(&config);
            if store.clear() {
                println!("Checkpoint cleared");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Validate(args) => validate(config, args).await,
    }
}

async fn validate(mut config: BatchConfig, args: ValidateArgs) -> Result<ExitCode> {
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    config.validate().context("invalid batch configuration")?;

    let monitor = Arc::new(
        ResourceMonitor::system(config.memory_limit_mb as f64)
            .context("initializing resource monitor")?,
    );
    monitor.start_background(config.monitor_interval())?;

    let store = CheckpointStore::from_config(&config);
    let (orchestrator, mut events) =
        BatchOrchestrator::new(config, Arc::clone(&monitor), Some(store));
    let orchestrator = Arc::new(orchestrator);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!("Batch event: {:?}", event);
        }
    });

    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight jobs");
                orchestrator.cancel();
            }
        });
    }

    let validator = match args.max_file_size_mb {
        Some(mb) => FileValidator::new().with_max_file_size_mb(mb),
        None => FileValidator::new(),
    };
    let job_fn: JobFn<u64> =
        Arc::new(move |job_id: &str| validator.validate(job_id).map(|input| input.size_bytes));

    let progress: ProgressCallback = Arc::new(|stats: &BatchStats| {
        info!(
            "Progress: {}/{} ({:.0}%), ~{:.0}s left",
            stats.completed(),
            stats.total_jobs,
            stats.progress_percent(),
            stats.estimated_remaining_secs
        );
    });

    let jobs: Vec<String> = args
        .files
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();

    let report = orchestrator
        .process(jobs, job_fn, Some(progress), args.batch_id)
        .await;
    monitor.stop();

    println!(
        "Batch {} {:?}: {} valid, {} invalid ({:.1}s, peak {:.0}MB)",
        report.batch_id,
        report.state,
        report.processed.len(),
        report.failed.len(),
        report.stats.elapsed_secs,
        monitor.peak_mb()
    );
    for failure in &report.failed {
        let kind = failure.kind.map(|k| k.to_string()).unwrap_or_default();
        println!("  {} [{}]: {}", failure.file, kind, failure.error);
    }
    if let Some(error) = &report.error {
        eprintln!("Batch error: {}", error);
    }

    if report.success && report.failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

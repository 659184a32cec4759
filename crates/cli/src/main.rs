//! `renderq` -- generation job orchestrator CLI.
//!
//! Submits workflow files to a ComfyUI server, drives each job through
//! admission, hybrid completion detection, the done-marker handoff,
//! and retries, then persists the run record and attempt log. The
//! `validate` subcommand replays a persisted record through the
//! offline contract validator.
//!
//! Policy knobs resolve as CLI flag, then `RENDERQ_*` environment
//! variable, then built-in default; an invalid resolved policy is
//! fatal before any job is submitted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use renderq_comfyui::ComfyUIBackend;
use renderq_core::job::{Job, JobId, JobPriority};
use renderq_core::policy::{PolicyOverrides, QueuePolicy};
use renderq_core::telemetry::RunRecord;
use renderq_core::validator::validate_run;
use renderq_monitor::ResourceMonitor;
use renderq_orchestrator::{RunDirs, Scheduler};

#[derive(Parser)]
#[command(name = "renderq", version, about = "Generation job orchestrator for ComfyUI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit workflow files and run them to completion.
    Run(RunArgs),
    /// Check a persisted run record against its attempt log.
    Validate(ValidateArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Workflow JSON files, one job each. The file stem becomes the
    /// job id and default output prefix.
    #[arg(required = true)]
    workflows: Vec<PathBuf>,

    /// HTTP base URL of the ComfyUI server.
    #[arg(long, default_value = "http://127.0.0.1:8188")]
    comfyui_url: String,

    /// Directory the producer writes frames and done markers into.
    #[arg(long)]
    output_dir: PathBuf,

    /// Where forced-copy recovery lands. Defaults to
    /// `<output-dir>/recovery`.
    #[arg(long)]
    recovery_dir: Option<PathBuf>,

    /// Output prefix override. Only valid with a single workflow.
    #[arg(long)]
    prefix: Option<String>,

    /// Dispatch priority for every job in this batch.
    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    priority: PriorityArg,

    /// Skip the event stream and rely on status polling alone.
    #[arg(long)]
    poll_only: bool,

    /// Per-attempt wall-clock ceiling in seconds.
    #[arg(long)]
    max_wait: Option<f64>,

    /// Seconds between status polls.
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Poll budget per attempt; 0 means unbounded.
    #[arg(long = "max-attempts")]
    max_poll_attempts: Option<u32>,

    /// Seconds to wait for the done marker after completion.
    #[arg(long)]
    post_completion_grace: Option<f64>,

    /// Retries allowed after the first attempt.
    #[arg(long)]
    retry_budget: Option<u32>,

    /// Minimum free VRAM in megabytes required to dispatch.
    #[arg(long = "min-resource-headroom")]
    min_headroom_mb: Option<u64>,

    /// Jobs allowed in flight at once.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Where the run record JSON is written.
    #[arg(long, default_value = "run_record.json")]
    record: PathBuf,

    /// Where attempt log lines are written.
    #[arg(long, default_value = "run.log")]
    log: PathBuf,
}

#[derive(clap::Args)]
struct ValidateArgs {
    /// Run record JSON produced by `renderq run`.
    #[arg(long)]
    record: PathBuf,

    /// Attempt log produced by the same run.
    #[arg(long)]
    log: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for JobPriority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::High => JobPriority::High,
            PriorityArg::Normal => JobPriority::Normal,
            PriorityArg::Low => JobPriority::Low,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "renderq=info,renderq_orchestrator=info,renderq_comfyui=info,renderq_monitor=info"
                .into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => run(args).await?,
        Command::Validate(args) => validate(args)?,
    };
    std::process::exit(code)
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let overrides = PolicyOverrides {
        max_wait_secs: args.max_wait,
        poll_interval_secs: args.poll_interval,
        max_poll_attempts: args.max_poll_attempts,
        post_completion_grace_secs: args.post_completion_grace,
        retry_budget: args.retry_budget,
        min_headroom_mb: args.min_headroom_mb,
        max_concurrency: args.concurrency,
        ..Default::default()
    };
    let policy = QueuePolicy::resolve(&overrides).context("queue policy rejected")?;

    if args.prefix.is_some() && args.workflows.len() > 1 {
        anyhow::bail!(
            "--prefix applies to a single workflow, but {} were given",
            args.workflows.len()
        );
    }

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("create output dir {}", args.output_dir.display()))?;
    let recovery_dir = args
        .recovery_dir
        .unwrap_or_else(|| args.output_dir.join("recovery"));

    let backend = if args.poll_only {
        ComfyUIBackend::poll_only(args.comfyui_url.clone())
    } else {
        ComfyUIBackend::start(args.comfyui_url.clone(), http_to_ws(&args.comfyui_url))
    };
    let monitor = Arc::new(ResourceMonitor::new(args.comfyui_url.clone()));

    let scheduler = Scheduler::new(
        policy.clone(),
        backend.clone(),
        monitor,
        RunDirs {
            output_dir: args.output_dir.clone(),
            recovery_dir,
        },
    );

    let mut ids: Vec<JobId> = Vec::new();
    for path in &args.workflows {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read workflow {}", path.display()))?;
        let payload: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse workflow {}", path.display()))?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| JobId::generate().to_string());
        if ids.iter().any(|id| id.0 == stem) {
            anyhow::bail!("duplicate workflow stem {stem:?}; job ids must be unique");
        }
        let prefix = args.prefix.clone().unwrap_or_else(|| stem.clone());

        let job = Job::new(JobId(stem), args.priority.into(), payload)
            .with_output_prefix(prefix)
            .with_retry_budget(policy.retry_budget);
        ids.push(scheduler.enqueue(job));
    }

    tracing::info!(
        jobs = ids.len(),
        comfyui_url = %args.comfyui_url,
        output_dir = %args.output_dir.display(),
        "Starting run",
    );

    let interrupt = tokio::spawn({
        let scheduler = scheduler.clone();
        let ids = ids.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling all jobs");
                for id in &ids {
                    scheduler.cancel(id);
                }
            }
        }
    });

    let record = scheduler.drain().await;
    interrupt.abort();
    backend.shutdown();

    record
        .save(&args.record)
        .with_context(|| format!("write run record {}", args.record.display()))?;
    let lines = scheduler.log_lines();
    std::fs::write(&args.log, lines.join("\n") + "\n")
        .with_context(|| format!("write attempt log {}", args.log.display()))?;

    let succeeded = record
        .jobs
        .iter()
        .filter(|j| j.job.status == renderq_core::job::JobStatus::Succeeded)
        .count();
    tracing::info!(
        succeeded,
        total = record.jobs.len(),
        record = %args.record.display(),
        log = %args.log.display(),
        "Run finished",
    );

    let violations = validate_run(&record, &lines);
    for violation in &violations {
        tracing::error!(%violation, "Contract violation");
    }

    Ok(if record.all_succeeded() && violations.is_empty() {
        0
    } else {
        1
    })
}

fn validate(args: ValidateArgs) -> anyhow::Result<i32> {
    let record = RunRecord::load(&args.record)
        .with_context(|| format!("load run record {}", args.record.display()))?;
    let lines: Vec<String> = std::fs::read_to_string(&args.log)
        .with_context(|| format!("read attempt log {}", args.log.display()))?
        .lines()
        .map(str::to_string)
        .collect();

    let violations = validate_run(&record, &lines);
    if violations.is_empty() {
        println!(
            "ok: {} job(s), {} attempt(s), contract satisfied",
            record.jobs.len(),
            record.jobs.iter().map(|j| j.attempts.len()).sum::<usize>(),
        );
        Ok(0)
    } else {
        for violation in &violations {
            eprintln!("violation: {violation}");
        }
        eprintln!("{} violation(s) found", violations.len());
        Ok(1)
    }
}

/// Derive the websocket endpoint from the HTTP base URL.
fn http_to_ws(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{url}")
    }
}

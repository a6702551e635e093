//! Operator CLI command definitions for eval-queue.
//!
//! The binary inspects and repairs a running queue. It never executes
//! evaluations itself: workers are embedded by the applications that own the
//! benchmark adapters.

use clap::Parser;
use serde_json::json;

use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::config::keys;
use crate::scheduler::{EvaluationJob, EvaluationQueueConfig, EvaluationQueueManager};

/// Default number of dead-letter entries listed.
const DEFAULT_DLQ_LIMIT: usize = 20;

/// Operator tool for the distributed evaluation queue.
#[derive(Parser, Debug)]
#[command(name = "eval-queue")]
#[command(about = "Inspect and manage the distributed evaluation job queue")]
#[command(version)]
#[command(
    long_about = "eval-queue inspects and repairs the Redis-backed evaluation job queue.\n\nQueue settings are read from EVAL_QUEUE_* environment variables.\n\nExample usage:\n  eval-queue stats\n  eval-queue dlq list --limit 5\n  eval-queue dlq retry 0b6f1c2e-..."
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = keys::REDIS_URL, global = true)]
    pub redis_url: Option<String>,

    /// Namespace prefix for every queue key.
    #[arg(long, env = keys::KEY_PREFIX, global = true)]
    pub key_prefix: Option<String>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Show queue depth, concurrency and totals.
    Stats,

    /// Show one job.
    Status(JobArgs),

    /// Cancel a pending job.
    Cancel(JobArgs),

    /// Inspect or requeue dead-lettered jobs.
    Dlq(DlqArgs),

    /// Fail ACTIVE jobs whose worker stopped reporting.
    Recover,

    /// Print queue metrics in Prometheus text format.
    Metrics,
}

/// Arguments naming a single job.
#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job id.
    pub job_id: String,
}

/// Dead-letter queue entrypoint arguments.
#[derive(Parser, Debug)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqSubcommand,
}

/// Dead-letter subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DlqSubcommand {
    /// List the oldest dead-lettered jobs.
    List {
        /// Maximum number of jobs to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_DLQ_LIMIT)]
        limit: usize,
    },

    /// Move a dead-lettered job back to the pending queue.
    Retry(JobArgs),
}

/// Parse CLI arguments without running any command.
///
/// Use this when you need the log level before initializing logging.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    let queue = EvaluationQueueManager::connect(config).await?;

    match cli.command {
        Commands::Stats => run_stats_command(&queue, cli.json).await?,
        Commands::Status(args) => run_status_command(&queue, &args.job_id, cli.json).await?,
        Commands::Cancel(args) => run_cancel_command(&queue, &args.job_id, cli.json).await?,
        Commands::Dlq(args) => match args.command {
            DlqSubcommand::List { limit } => run_dlq_list_command(&queue, limit, cli.json).await?,
            DlqSubcommand::Retry(args) => {
                run_dlq_retry_command(&queue, &args.job_id, cli.json).await?
            }
        },
        Commands::Recover => run_recover_command(&queue, cli.json).await?,
        Commands::Metrics => run_metrics_command(&queue).await?,
    }
    Ok(())
}

/// Environment configuration with command-line overrides applied.
fn resolve_config(cli: &Cli) -> anyhow::Result<EvaluationQueueConfig> {
    let mut config = EvaluationQueueConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(prefix) = &cli.key_prefix {
        config = config.with_key_prefix(prefix.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run_stats_command(
    queue: &EvaluationQueueManager,
    json_output: bool,
) -> anyhow::Result<()> {
    let metrics = queue.get_metrics().await?;

    if json_output {
        let models: serde_json::Map<String, serde_json::Value> = metrics
            .models
            .iter()
            .map(|(model, m)| {
                (
                    model.clone(),
                    json!({"queue_depth": m.queue_depth, "active": m.active}),
                )
            })
            .collect();
        let output = json!({
            "queue_depth": metrics.queue_depth,
            "delayed": metrics.delayed,
            "active": metrics.active,
            "completed_total": metrics.completed_total,
            "failed_total": metrics.failed_total,
            "dead_lettered_total": metrics.dead_lettered_total,
            "dead_letter_size": metrics.dead_letter_size,
            "average_processing_ms": metrics.average_processing_ms,
            "claim_mode": metrics.claim_mode.to_string(),
            "models": models,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("=== Evaluation Queue ===");
    println!("Claim mode:      {}", metrics.claim_mode);
    println!("Pending:         {}", metrics.queue_depth);
    println!("Delayed:         {}", metrics.delayed);
    println!("Active:          {}", metrics.active);
    println!("Completed:       {}", metrics.completed_total);
    println!("Failures:        {}", metrics.failed_total);
    println!("Dead-lettered:   {}", metrics.dead_lettered_total);
    println!("DLQ size:        {}", metrics.dead_letter_size);
    println!("Avg processing:  {:.1}ms", metrics.average_processing_ms);
    if !metrics.models.is_empty() {
        println!();
        println!("  {:<40} {:>8} {:>8}", "model", "pending", "active");
        for (model, m) in &metrics.models {
            println!("  {:<40} {:>8} {:>8}", model, m.queue_depth, m.active);
        }
    }
    Ok(())
}

async fn run_status_command(
    queue: &EvaluationQueueManager,
    job_id: &str,
    json_output: bool,
) -> anyhow::Result<()> {
    let Some(job) = queue.get_job(job_id).await? else {
        anyhow::bail!("job {} not found", job_id);
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

async fn run_cancel_command(
    queue: &EvaluationQueueManager,
    job_id: &str,
    json_output: bool,
) -> anyhow::Result<()> {
    let cancelled = queue.cancel(job_id).await?;

    if json_output {
        println!("{}", json!({"job_id": job_id, "cancelled": cancelled}));
    } else if cancelled {
        println!("✓ Cancelled {}", job_id);
    } else {
        println!("✗ {} is not pending (unknown, active or finished)", job_id);
    }
    Ok(())
}

async fn run_dlq_list_command(
    queue: &EvaluationQueueManager,
    limit: usize,
    json_output: bool,
) -> anyhow::Result<()> {
    let jobs = queue.get_dlq_jobs(limit).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("Dead letter queue is empty.");
        return Ok(());
    }
    for job in &jobs {
        println!(
            "{}  {:<30} attempts={}  {}",
            job.id,
            job.model_id,
            job.attempt_count,
            job.error_message.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_dlq_retry_command(
    queue: &EvaluationQueueManager,
    job_id: &str,
    json_output: bool,
) -> anyhow::Result<()> {
    let requeued = queue.retry_dlq_job(job_id).await?;

    if json_output {
        println!("{}", json!({"job_id": job_id, "requeued": requeued}));
    } else if requeued {
        println!("✓ Requeued {}", job_id);
    } else {
        println!("✗ {} is not in the dead letter queue", job_id);
    }
    Ok(())
}

async fn run_recover_command(
    queue: &EvaluationQueueManager,
    json_output: bool,
) -> anyhow::Result<()> {
    let recovered = queue.recover_stale_jobs().await?;

    if json_output {
        println!("{}", json!({"recovered": recovered}));
    } else {
        println!("Recovered {} stale job(s)", recovered);
    }
    Ok(())
}

async fn run_metrics_command(queue: &EvaluationQueueManager) -> anyhow::Result<()> {
    init_metrics()?;
    queue.publish_metrics().await?;
    print!("{}", export_metrics());
    Ok(())
}

fn print_job(job: &EvaluationJob) {
    let timestamp = |ts: &Option<chrono::DateTime<chrono::Utc>>| {
        ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };

    println!("Job:          {}", job.id);
    println!("Model:        {}", job.model_id);
    println!("Status:       {}", job.status);
    println!("Priority:     {}", job.priority);
    println!("Attempts:     {}/{}", job.attempt_count, job.max_attempts);
    println!("Timeout:      {}s", job.timeout_seconds);
    println!("Created:      {}", job.created_at.to_rfc3339());
    println!("Started:      {}", timestamp(&job.started_at));
    println!("Completed:    {}", timestamp(&job.completed_at));
    println!("Next retry:   {}", timestamp(&job.next_retry_at));
    if let Some(error) = &job.error_message {
        println!("Error:        {}", error);
    }
    if let Some(result) = &job.result {
        println!("Result:       {}", result);
    }
}

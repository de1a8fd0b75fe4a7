use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use job_executor::config::{ExecutorConfig, LeaseConfig, LockRequeuePolicy, SandboxConfig};
use job_executor::dispatcher::Dispatcher;
use job_executor::job::{load_jobs_file, JobRunRequest, Step};
use job_executor::lease::InMemoryLeaseService;
use job_executor::queue::InMemoryQueue;
use job_executor::runtime::DockerCliRuntime;
use job_executor::shutdown::install_shutdown_handler;
use job_executor::sink::TracingSink;

#[derive(Parser, Debug)]
#[command(name = "job-executor")]
#[command(version)]
#[command(about = "Runs queued jobs in sandboxed containers under a distributed lease")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start an executor in standalone mode (in-process queue and lease service)
    Run(RunArgs),

    /// Validate a job file and print the decoded requests
    Check {
        /// JSON file containing an array of job requests
        jobs: PathBuf,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON file containing an array of job requests to enqueue on startup
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Ad-hoc command to enqueue as a single-step job (repeatable)
    #[arg(long = "exec")]
    exec: Vec<String>,

    /// Executor ID used in lease owner tokens (random if omitted)
    #[arg(long)]
    executor_id: Option<String>,

    /// Maximum number of concurrently running jobs
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Docker image for jobs that do not specify one
    #[arg(long, default_value = "alpine:latest")]
    image: String,

    /// Allow network access inside job containers
    #[arg(long)]
    allow_network: bool,

    /// Lease time-to-live in seconds
    #[arg(long, default_value = "30")]
    lease_ttl_secs: u64,

    /// Lease renewal interval in seconds (must be below the ttl)
    #[arg(long, default_value = "10")]
    renew_interval_secs: u64,

    /// Deadline for jobs without their own timeout, in seconds
    #[arg(long, default_value = "3600")]
    job_timeout_secs: u64,

    /// Seconds in-flight jobs get to clean up on shutdown
    #[arg(long, default_value = "30")]
    grace_secs: u64,

    /// Drop a job after this many lock-contention requeues (unbounded if omitted)
    #[arg(long)]
    max_lock_requeues: Option<u32>,

    /// Milliseconds to wait before requeuing a job whose lease is held elsewhere
    #[arg(long, default_value = "1000")]
    lock_requeue_delay_ms: u64,
}

impl RunArgs {
    fn to_config(&self) -> ExecutorConfig {
        let mut config = match &self.executor_id {
            Some(id) => ExecutorConfig::new(id.clone()),
            None => ExecutorConfig::default(),
        };
        config.sandbox = SandboxConfig {
            image: self.image.clone(),
            network_disabled: !self.allow_network,
            ..SandboxConfig::default()
        };
        config.lease = LeaseConfig::new(
            Duration::from_secs(self.lease_ttl_secs),
            Duration::from_secs(self.renew_interval_secs),
        );
        config.dispatcher.workers = self.workers;
        config.dispatcher.default_job_timeout = Duration::from_secs(self.job_timeout_secs);
        config.dispatcher.grace = Duration::from_secs(self.grace_secs);
        config.dispatcher.lock_requeue = LockRequeuePolicy {
            max_requeues: self.max_lock_requeues,
            delay: Duration::from_millis(self.lock_requeue_delay_ms),
        };
        config
    }

    fn initial_jobs(&self) -> Result<Vec<JobRunRequest>, Box<dyn std::error::Error>> {
        let mut jobs = match &self.jobs {
            Some(path) => load_jobs_file(path)?,
            None => Vec::new(),
        };
        let next_id = jobs.iter().map(|j| j.job_id).max().unwrap_or(0) + 1;
        for (offset, command) in self.exec.iter().enumerate() {
            jobs.push(JobRunRequest::new(
                next_id + offset as u64,
                vec![Step::new("exec", command.clone())],
            ));
        }
        Ok(jobs)
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_executor(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.to_config();
    config.validate()?;
    let jobs = args.initial_jobs()?;

    tracing::info!(
        executor_id = %config.executor_id,
        workers = config.dispatcher.workers,
        image = %config.sandbox.image,
        lease_ttl_secs = config.lease.ttl.as_secs(),
        renew_interval_secs = config.lease.renew_interval.as_secs(),
        jobs = jobs.len(),
        "Starting job executor"
    );

    let queue = Arc::new(InMemoryQueue::new());
    for job in &jobs {
        let message_id = queue.publish_request(job).await?;
        tracing::debug!(job_id = job.job_id, message_id = %message_id, "Job enqueued");
    }

    let dispatcher = Dispatcher::from_config(
        &config,
        queue,
        Arc::new(InMemoryLeaseService::new()),
        Arc::new(DockerCliRuntime::new(config.sandbox.clone())),
        Arc::new(TracingSink),
    )?;

    let shutdown = install_shutdown_handler()?;
    dispatcher.run(shutdown).await?;

    tracing::info!("Job executor stopped");
    Ok(())
}

fn check_jobs(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = load_jobs_file(&path)?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    eprintln!("{} job(s) OK", jobs.len());
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_executor(run_args).await?,
        Commands::Check { jobs } => check_jobs(jobs)?,
    }

    Ok(())
}

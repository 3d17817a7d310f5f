use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use infer_queue::api::{run_api_server, ApiState};
use infer_queue::config::{parse_seconds, ManagerConfig, StoreKind, WorkerConfig};
use infer_queue::scheduler::{JobQueue, JobRecord, QueueStats, WorkerRecord};
use infer_queue::shutdown::install_shutdown_handler;
use infer_queue::store::{JobStore, MemoryStore};
use infer_queue::worker::OllamaBackend;

#[derive(Parser, Debug)]
#[command(name = "infer-queue")]
#[command(version)]
#[command(about = "FIFO inference job queue with GPU-aware polling workers")]
#[command(propagate_version = true)]
struct Args {
    /// Log output format for the manager and worker
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the queue manager HTTP API
    Manager(ManagerArgs),

    /// Run a worker that pulls jobs and sends them to a model backend
    Worker(WorkerArgs),

    /// Job commands against a running manager
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// List registered workers
    Workers {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Manager Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ManagerArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "API_PORT", default_value = "5000")]
    port: u16,

    /// Job store backend
    #[arg(long, env = "JOB_STORE", value_enum, default_value = "redis")]
    store: StoreArg,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    redis_url: String,

    /// Seconds `/get_job` waits for work before answering 204 (0 = don't wait)
    #[arg(long, env = "REDIS_BLOCK_TIMEOUT", default_value = "5")]
    block_timeout: u64,

    /// Seconds a job record lives after its last write
    #[arg(long, env = "JOB_TTL_SECONDS", default_value = "3600")]
    job_ttl: u64,

    /// Finished jobs kept for `/recent_jobs`
    #[arg(long, env = "JOB_HISTORY_SIZE", default_value = "50")]
    history_size: usize,

    /// Namespace for store keys
    #[arg(long, default_value = "infer")]
    key_prefix: String,

    /// Log full payloads and results instead of previews
    #[arg(long, env = "DEBUG_LOGGING")]
    debug_logging: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreArg {
    Redis,
    Memory,
}

impl From<StoreArg> for StoreKind {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Redis => StoreKind::Redis,
            StoreArg::Memory => StoreKind::Memory,
        }
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Queue manager base URL
    #[arg(long, env = "CEREBRO_URL", default_value = "http://localhost:5000")]
    queue_url: String,

    /// Model backend chat endpoint
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434/api/chat")]
    backend_url: String,

    #[arg(long, env = "MODEL_NAME", default_value = "phi4-mini")]
    model: String,

    /// Worker identifier (defaults to the hostname)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Seconds between polls when idle or when the GPU is busy
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value = "2")]
    poll_interval: f64,

    /// GPU utilization percentage above which polling is deferred
    #[arg(long, env = "GPU_THRESHOLD", default_value = "30")]
    gpu_threshold: f64,

    /// Upper bound for retry backoff, in seconds
    #[arg(long, env = "MAX_BACKOFF_SECONDS", default_value = "30")]
    max_backoff: f64,

    /// Per-request timeout, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value = "30")]
    request_timeout: f64,

    /// Skip the nvidia-smi admission check
    #[arg(long)]
    no_gpu_check: bool,

    /// Check that the model is installed on the backend before starting
    #[arg(long)]
    verify_model: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Queue manager base URL
    #[arg(long, short = 'a', env = "CEREBRO_URL", default_value = "http://localhost:5000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a single-prompt job
    Submit {
        /// The user prompt
        prompt: String,

        /// Optional system message placed before the prompt
        #[arg(long)]
        system: Option<String>,

        /// Optional metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Show the full record of a job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Show queue depth
    Stats,
    /// List recently finished jobs
    Recent {
        #[arg(long, default_value = "10")]
        limit: u32,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn base_url(addr: &str) -> String {
    addr.trim().trim_end_matches('/').to_string()
}

/// Send a request to the manager, exiting with its error message on failure.
async fn call_manager(
    request: reqwest::RequestBuilder,
) -> Result<Value, Box<dyn std::error::Error>> {
    let response = request.send().await?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        eprintln!("Error: {} ({})", message, status);
        std::process::exit(1);
    }
    Ok(body)
}

fn content_of(result: Option<&Value>) -> Option<&str> {
    let result = result?;
    result
        .pointer("/message/content")
        .or_else(|| result.get("response"))
        .and_then(Value::as_str)
}

fn format_timestamp(ts: f64) -> String {
    chrono::DateTime::from_timestamp_micros((ts * 1_000_000.0) as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

// =============================================================================
// Manager
// =============================================================================

async fn open_store(config: &ManagerConfig) -> Result<Arc<dyn JobStore>, Box<dyn std::error::Error>> {
    match config.store {
        StoreKind::Memory => {
            tracing::warn!("Using in-memory job store; jobs are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreKind::Redis => {
            let store = infer_queue::store::RedisStore::connect(&config.redis_url).await?;
            tracing::info!(url = %config.redis_url, "Connected to Redis");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreKind::Redis => Err("this build has no Redis support; use --store memory".into()),
    }
}

async fn run_manager(args: ManagerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let config = ManagerConfig {
        store: args.store.into(),
        redis_url: args.redis_url,
        key_prefix: args.key_prefix,
        debug_payloads: args.debug_logging,
        ..ManagerConfig::new(listen_addr)
            .with_block_timeout(Duration::from_secs(args.block_timeout))
            .with_job_ttl(Duration::from_secs(args.job_ttl))
            .with_history_size(args.history_size)
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        block_timeout = ?config.block_timeout,
        job_ttl = ?config.job_ttl,
        history_size = config.history_size,
        debug_payloads = config.debug_payloads,
        "Starting queue manager"
    );

    let store = open_store(&config).await?;
    let queue = JobQueue::new(store, &config);
    if !queue.health().await {
        tracing::warn!("Job store did not answer the health check; continuing");
    }

    let state = ApiState::new(queue).with_debug_payloads(config.debug_payloads);
    let shutdown = install_shutdown_handler();
    run_api_server(config.listen_addr, state, shutdown).await?;

    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::new(&args.queue_url, &args.backend_url, &args.model)
        .with_worker_id(args.worker_id.as_deref().unwrap_or_default())
        .with_poll_interval(parse_seconds("poll_interval", args.poll_interval)?)
        .with_gpu_threshold(args.gpu_threshold)
        .with_max_backoff(parse_seconds("max_backoff", args.max_backoff)?)
        .with_request_timeout(parse_seconds("request_timeout", args.request_timeout)?)
        .with_gpu_check(!args.no_gpu_check);

    tracing::info!(
        worker_id = %config.worker_id,
        queue_url = %config.queue_url,
        backend_url = %config.backend_url,
        model = %config.model_name,
        gpu_check = config.check_gpu,
        gpu_threshold = config.gpu_threshold,
        "Starting worker"
    );

    if args.verify_model {
        OllamaBackend::new(&config)?.verify_model().await?;
    }

    let shutdown = install_shutdown_handler();
    drive_worker(config, shutdown).await
}

#[cfg(feature = "engine")]
async fn drive_worker(
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    use infer_queue::worker::{WorkerEngine, WorkerEvent};
    use tokio::sync::broadcast::error::RecvError;

    let mut engine = WorkerEngine::new(config);
    let mut events = engine.subscribe();
    engine.start()?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(WorkerEvent::Stats(stats)) => tracing::info!(
                    uptime = stats.uptime,
                    jobs_completed = stats.jobs_completed,
                    jobs_failed = stats.jobs_failed,
                    avg_job_time = stats.avg_job_time,
                    current_job = ?stats.current_job_id,
                    "Worker stats"
                ),
                Ok(WorkerEvent::Status(state)) => tracing::debug!(state = %state, "Worker state changed"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Dropped worker events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    tokio::task::spawn_blocking(move || engine.stop()).await?;
    Ok(())
}

#[cfg(not(feature = "engine"))]
async fn drive_worker(
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    use infer_queue::worker::{WorkerControl, WorkerCore};

    let core = WorkerCore::new(config)?.with_control(WorkerControl::with_token(shutdown));
    core.run().await;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &reqwest::Client,
    args: &ClientArgs,
    prompt: String,
    system: Option<String>,
    metadata: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": prompt}));

    let metadata: Option<Value> = metadata.as_deref().map(serde_json::from_str).transpose()?;
    let mut body = json!({ "messages": messages });
    if let Some(metadata) = metadata {
        body["metadata"] = metadata;
    }

    let response = call_manager(
        client
            .post(format!("{}/submit_job", base_url(&args.addr)))
            .json(&body),
    )
    .await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", response["job_id"].as_str().unwrap_or("-"));
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &reqwest::Client,
    args: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = call_manager(
        client.get(format!("{}/get_result/{}", base_url(&args.addr), job_id)),
    )
    .await?;
    let job: JobRecord = serde_json::from_value(response)?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job ID:     {}", job.job_id);
            println!("Status:     {}", job.status);
            println!("Created:    {}", format_timestamp(job.created_at));
            if let Some(started) = job.started_at {
                println!("Started:    {}", format_timestamp(started));
            }
            if let Some(completed) = job.completed_at {
                println!("Completed:  {}", format_timestamp(completed));
            }
            if let Some(content) = content_of(job.result.as_ref()) {
                println!("Result:");
                for line in content.lines() {
                    println!("  {}", line);
                }
            }
            if let Some(error) = &job.error {
                println!("Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_stats(
    client: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = call_manager(client.get(format!("{}/stats", base_url(&args.addr)))).await?;
    let stats: QueueStats = serde_json::from_value(response)?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Table => {
            println!("Queued:     {}", stats.queued_count);
            println!("Processing: {}", stats.processing_count);
        }
    }
    Ok(())
}

async fn handle_job_recent(
    client: &reqwest::Client,
    args: &ClientArgs,
    limit: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = call_manager(
        client
            .get(format!("{}/recent_jobs", base_url(&args.addr)))
            .query(&[("limit", limit)]),
    )
    .await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => {
            let jobs = response.as_array().cloned().unwrap_or_default();
            if jobs.is_empty() {
                println!("No finished jobs.");
                return Ok(());
            }
            println!("{:<38} {:<10} PREVIEW", "JOB ID", "STATUS");
            println!("{}", "-".repeat(78));
            for job in &jobs {
                let preview = job["result_preview"]
                    .as_str()
                    .or_else(|| job["error"].as_str())
                    .or_else(|| job["preview"].as_str())
                    .unwrap_or("-");
                println!(
                    "{:<38} {:<10} {}",
                    job["job_id"].as_str().unwrap_or("-"),
                    job["status"].as_str().unwrap_or("-"),
                    preview
                );
            }
        }
    }
    Ok(())
}

async fn handle_workers(
    client: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = call_manager(client.get(format!("{}/workers", base_url(&args.addr)))).await?;
    let workers: Vec<WorkerRecord> = serde_json::from_value(response)?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workers)?),
        OutputFormat::Table => {
            if workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!("{:<24} {:<24} {:<16} REGISTERED", "WORKER", "HOSTNAME", "MODEL");
            println!("{}", "-".repeat(88));
            for worker in &workers {
                let field = |key: &str| {
                    worker
                        .metadata
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or("-")
                        .to_string()
                };
                println!(
                    "{:<24} {:<24} {:<16} {}",
                    worker.worker_id,
                    field("hostname"),
                    field("model"),
                    format_timestamp(worker.registered_at)
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Manager(manager_args) => {
            init_tracing(args.log_format);
            run_manager(manager_args).await?;
        }
        Commands::Worker(worker_args) => {
            init_tracing(args.log_format);
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?;

            match command {
                JobCommands::Submit {
                    prompt,
                    system,
                    metadata,
                } => handle_job_submit(&http, &client, prompt, system, metadata).await?,
                JobCommands::Status { job_id } => handle_job_status(&http, &client, job_id).await?,
                JobCommands::Stats => handle_job_stats(&http, &client).await?,
                JobCommands::Recent { limit } => handle_job_recent(&http, &client, limit).await?,
            }
        }
        Commands::Workers { client } => {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?;
            handle_workers(&http, &client).await?;
        }
    }

    Ok(())
}

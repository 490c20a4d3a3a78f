use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infer_core::config::{BenchConfig, ThresholdConfig, ViolationTolerance};
use infer_core::controller::{run_bench, CancellationToken};
use infer_core::error::{BenchError, Outcome};
use infer_core::server_stats::ServerStatsMonitor;
use infer_core::transport::Endpoint;

#[derive(Parser, Debug)]
#[command(author, version, about = "Open-loop latency/queueing benchmark for a streaming inference endpoint")]
struct Args {
    /// Server URL (http://host:port)
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    url: String,

    /// Name of model to send requests to
    #[arg(long)]
    model_name: String,

    /// Model version to send requests to
    #[arg(long, default_value_t = 1)]
    model_version: u32,

    /// Rate at which to generate requests (req/s, open-loop)
    #[arg(long)]
    generation_rate: f64,

    /// Number of requests to send for profiling
    #[arg(long, default_value_t = 10_000)]
    num_iterations: u64,

    /// Leading requests recorded but excluded from threshold evaluation
    #[arg(long, default_value_t = 0)]
    warm_up: u64,

    /// Input window shape, comma separated
    #[arg(long, value_delimiter = ',', default_value = "1,8192")]
    input_shape: Vec<usize>,

    /// Prefix to attach to output artifacts
    #[arg(long, default_value = "")]
    file_prefix: String,

    /// Maximum allowable end-to-end latency in seconds
    #[arg(long, default_value_t = 1.0)]
    latency_threshold: f64,

    /// Maximum allowable queuing time in microseconds
    #[arg(long, default_value_t = 100_000)]
    queue_threshold_us: u64,

    /// Violations tolerated before the run is stopped
    #[arg(long, default_value_t = 0)]
    violation_tolerance: u64,

    /// Stop once violations exceed this fraction of steady records
    /// (takes precedence over --violation-tolerance)
    #[arg(long)]
    violation_fraction: Option<f64>,

    /// http1 connections to the endpoint
    #[arg(long, default_value_t = 4)]
    connections: usize,

    /// Per-connection request queue depth
    #[arg(long, default_value_t = 8)]
    conn_queue: usize,

    /// Grace period for in-flight requests at shutdown (ms)
    #[arg(long, default_value_t = 2_000)]
    grace_ms: u64,

    /// Flush client-stats.csv every N records
    #[arg(long, default_value_t = 64)]
    flush_every: usize,

    /// Seed for the synthetic payloads
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Optional Prometheus endpoint to poll into server-stats.csv
    #[arg(long)]
    metrics_url: Option<String>,

    /// Poll interval for --metrics-url (ms)
    #[arg(long, default_value_t = 1_000)]
    metrics_interval_ms: u64,

    /// Log file override (default <prefix>_output.log)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = BenchConfig {
        endpoint: args.url.clone(),
        model_name: args.model_name.clone(),
        model_version: args.model_version,
        generation_rate: args.generation_rate,
        num_iterations: args.num_iterations,
        warm_up: args.warm_up,
        input_shape: args.input_shape.clone(),
        seed: args.seed,
        file_prefix: args.file_prefix.clone(),
        flush_every: args.flush_every,
        connections: args.connections,
        conn_queue: args.conn_queue,
        grace_ms: args.grace_ms,
    };
    let thresholds = ThresholdConfig {
        latency_threshold_s: args.latency_threshold,
        queue_threshold_us: args.queue_threshold_us,
        tolerance: match args.violation_fraction {
            Some(f) => ViolationTolerance::Fraction(f),
            None => ViolationTolerance::Count(args.violation_tolerance),
        },
    };

    // a bad config must fail before any artifact (including the log file)
    // is created
    if let Err(e) = cfg.validate(&thresholds) {
        eprintln!("infer-bench: {e}");
        return ExitCode::from(Outcome::FatalError.exit_code());
    }
    if let Err(e) = Endpoint::parse(&cfg.endpoint, &cfg.model_name, cfg.model_version) {
        eprintln!("infer-bench: {e}");
        return ExitCode::from(Outcome::FatalError.exit_code());
    }

    let log_path = args.log_file.clone().unwrap_or_else(|| cfg.log_path());
    let log_file = match std::fs::File::create(&log_path) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            eprintln!("infer-bench: create log file {}: {e}", log_path.display());
            return ExitCode::from(Outcome::FatalError.exit_code());
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .init();

    log_cpu_info();
    tracing::info!(
        url = %cfg.endpoint,
        model = %cfg.model_name,
        version = cfg.model_version,
        rate = cfg.generation_rate,
        iterations = cfg.num_iterations,
        warm_up = cfg.warm_up,
        connections = cfg.connections,
        "gathering performance metrics"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    // optional side telemetry from the server's metrics endpoint
    let scrape_cancel = CancellationToken::new();
    let mut scrape_task = None;
    if let Some(url) = &args.metrics_url {
        match ServerStatsMonitor::create(
            url,
            &cfg.server_stats_path(),
            Duration::from_millis(args.metrics_interval_ms.max(100)),
        ) {
            Ok(mon) => {
                scrape_task = Some(tokio::spawn(mon.run(scrape_cancel.clone())));
            }
            Err(e) => tracing::warn!("server-stats monitor disabled: {e:#}"),
        }
    }

    let result = run_bench(cfg, thresholds, cancel).await;

    scrape_cancel.cancel();
    if let Some(task) = scrape_task {
        let _ = task.await;
    }

    match result {
        Ok(report) => {
            tracing::info!(
                outcome = report.outcome.as_str(),
                sent = report.requests_sent,
                completed = report.requests_completed,
                incomplete = report.incomplete,
                spurious = report.spurious_dropped,
                backpressure = report.backpressure_events,
                violations = report.violations_observed,
                "benchmark exit"
            );
            ExitCode::from(report.outcome.exit_code())
        }
        Err(e) => {
            match &e {
                BenchError::Config(e) => tracing::error!("invalid configuration: {e}"),
                BenchError::Connection(e) => tracing::error!("connection failure: {e}"),
                BenchError::Internal(e) => tracing::error!("fatal: {e:#}"),
            }
            ExitCode::from(Outcome::FatalError.exit_code())
        }
    }
}

// best effort, mirrors what /proc/cpuinfo exposes; skipped off-linux
fn log_cpu_info() {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return;
    };
    let field = |prefix: &str| -> Vec<String> {
        cpuinfo
            .lines()
            .filter(|l| l.starts_with(prefix))
            .filter_map(|l| l.split(':').nth(1))
            .map(|v| v.trim().to_string())
            .collect()
    };
    for (family, model) in field("cpu family").iter().zip(field("model\t").iter()) {
        tracing::info!("CPU family {family}, model {model}");
    }
}

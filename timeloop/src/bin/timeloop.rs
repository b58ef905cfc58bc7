use std::{
    env,
    fs::{self, OpenOptions},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use timeloop::{
    clock::{Clock, RealClock},
    config::{self, DataDir, RecordConfig},
    metadata::{self, Metadata},
    record,
    replay::{self, Scheduler},
    sink::{Retry, signalfx::HttpSink},
    source::signalfx::{HttpCatalog, HttpSource},
};
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Recording failed: {0}")]
    Record(#[from] record::Error),
    #[error("Failed to load metadata: {0}")]
    Metadata(#[from] metadata::Error),
    #[error("Replay task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Missing required argument --{flag}, or environment variable {env}")]
    MissingArgument { flag: &'static str, env: &'static str },
}

fn default_data_dir() -> String {
    "/opt/data".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one cycle of metric time series into a data directory
    Record(RecordArgs),
    /// Replay a data directory against an ingest endpoint until interrupted
    Replay(ReplayArgs),
    /// Validate a recording configuration and exit
    ConfigCheck(ConfigCheckArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// write logs to this file instead of stdout; the lowercase `log_file`
    /// variable is also read
    #[clap(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,
    /// serve internal telemetry in prometheus format on this address
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// the maximum time to wait, in seconds, for tasks to finish on shutdown
    #[clap(long, default_value_t = 5)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct RecordArgs {
    /// path on disk to the recording configuration
    #[clap(long)]
    config_path: PathBuf,
    /// time allowed for one request to the catalog or time series store, in
    /// milliseconds
    #[clap(long, default_value_t = 30_000)]
    request_timeout_ms: u64,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct ReplayArgs {
    /// the recorded data directory to replay
    #[clap(long, env = "DATA_DIR", default_value_t = default_data_dir())]
    data_dir: String,
    /// base URL of the ingest endpoint; the lowercase `ingest_endpoint`
    /// variable is also read
    #[clap(long, env = "INGEST_ENDPOINT")]
    ingest_endpoint: Option<String>,
    /// token sent with every ingest request; the lowercase `api_token`
    /// variable is also read
    #[clap(long, env = "API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,
    /// log per-kind counts and the original time of every dispatch; the
    /// lowercase `verbose` variable is also read
    #[clap(long, env = "VERBOSE")]
    verbose: bool,
    /// time allowed for one ingest request, in milliseconds, never more than
    /// one slot interval
    #[clap(long, default_value_t = 10_000)]
    request_timeout_ms: u64,
    /// extra attempts for a batch the ingest endpoint rejects
    #[clap(long, default_value_t = 0)]
    retries: u32,
    /// pause between attempts, in milliseconds
    #[clap(long, default_value_t = 1000)]
    retry_backoff_ms: u64,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct ConfigCheckArgs {
    /// path on disk to the recording configuration
    #[clap(long)]
    config_path: PathBuf,
}

/// Container deployments predating the flags above set lowercase variables.
fn legacy_env<F>(flag: Option<String>, key: &str, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    flag.or_else(|| lookup(key).filter(|value| !value.is_empty()))
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn init_logging(log_file: Option<&Path>) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_writer(Mutex::new(file)).finish().init();
        }
        None => builder.finish().init(),
    }
    Ok(())
}

fn install_telemetry(addr: Option<SocketAddr>) -> Result<(), Error> {
    if let Some(addr) = addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("serving prometheus telemetry on {addr}");
    }
    Ok(())
}

fn now_seconds() -> i64 {
    RealClock.now_ms().div_euclid(1000)
}

fn config_check(args: &ConfigCheckArgs) -> Result<(), Error> {
    let config = RecordConfig::load(&args.config_path)?;
    let settings = config.validate(now_seconds())?;
    info!(
        "configuration valid: {range} window [{start}, {end}) in {slots} slots, {queries} queries",
        range = settings.layout.range(),
        start = settings.start,
        end = settings.end,
        slots = settings.layout.slots_per_cycle(),
        queries = settings.queries.len(),
    );
    Ok(())
}

async fn run_record(args: RecordArgs) -> Result<(), Error> {
    install_telemetry(args.common.prometheus_addr)?;

    let raw = fs::read_to_string(&args.config_path)?;
    let config: RecordConfig = raw.parse()?;
    let settings = config.validate(now_seconds())?;

    let timeout = Duration::from_millis(args.request_timeout_ms);
    let catalog =
        HttpCatalog::new(&settings.api_server, &settings.record_token).with_timeout(timeout);
    let source = HttpSource::new(&settings.ts_server, &settings.record_token).with_timeout(timeout);
    let summary = record::record(&settings, &raw, &catalog, &source).await?;
    info!(
        "recording written to {dir:?}: {metrics} metrics, {skipped} skipped",
        dir = settings.data_dir.root(),
        metrics = summary.metrics,
        skipped = summary.skipped,
    );
    Ok(())
}

async fn run_replay(args: ReplayArgs) -> Result<(), Error> {
    install_telemetry(args.common.prometheus_addr)?;

    let ingest_endpoint = legacy_env(args.ingest_endpoint, "ingest_endpoint", env_var).ok_or(
        Error::MissingArgument {
            flag: "ingest-endpoint",
            env: "INGEST_ENDPOINT",
        },
    )?;
    let api_token = legacy_env(args.api_token, "api_token", env_var).ok_or(
        Error::MissingArgument {
            flag: "api-token",
            env: "API_TOKEN",
        },
    )?;
    let verbose = args.verbose || env_var("verbose").is_some_and(|value| value == "true");

    let data_dir = DataDir::new(&args.data_dir);
    data_dir.validate()?;
    let layout = RecordConfig::load(&data_dir.config_path())?.layout()?;
    let metadata = Metadata::load(&data_dir.metadata_path())?;
    info!(
        "loaded metadata for {count} metrics from {dir:?}",
        count = metadata.len(),
        dir = data_dir.root(),
    );

    let timeout = Duration::from_millis(args.request_timeout_ms)
        .min(Duration::from_secs(layout.interval().unsigned_abs()));
    let sink = Retry::new(
        HttpSink::new(&ingest_endpoint, &api_token).with_timeout(timeout),
        args.retries,
        Duration::from_millis(args.retry_backoff_ms),
    );
    let config = replay::Config {
        layout,
        ts_dir: data_dir.ts_dir(),
        verbose,
    };
    let (shutdown_watcher, shutdown_broadcaster) = timeloop_signal::signal();
    let mut run = tokio::spawn(
        Scheduler::new(config, metadata, RealClock, sink, shutdown_watcher).run(),
    );

    let finished = tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("received ctrl-c");
            None
        }
        res = &mut run => Some(res),
    };
    let status = match finished {
        Some(res) => res?,
        None => {
            shutdown_broadcaster.signal_and_wait().await;
            run.await?
        }
    };
    info!("replay ended: {status:?}");
    Ok(())
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let (log_file, max_shutdown_delay) = match &cli.command {
        Commands::Record(args) => (args.common.log_file.clone(), args.common.max_shutdown_delay),
        Commands::Replay(args) => (args.common.log_file.clone(), args.common.max_shutdown_delay),
        Commands::ConfigCheck(_) => (None, 0),
    };
    let log_file = log_file.or_else(|| legacy_env(None, "log_file", env_var).map(PathBuf::from));
    init_logging(log_file.as_deref())?;

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting timeloop {version}.");

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(async move {
        match cli.command {
            Commands::Record(args) => run_record(args).await,
            Commands::Replay(args) => run_replay(args).await,
            Commands::ConfigCheck(args) => config_check(&args),
        }
    });
    if let Err(err) = &res {
        error!("{err}");
    }

    info!("Shutting down runtime with a {max_shutdown_delay} second delay.");
    runtime.shutdown_timeout(Duration::from_secs(max_shutdown_delay.into()));
    info!("Bye.");
    res
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, StoreBackend};
use floodgate::http::{AdmissionState, HttpServer};
use floodgate::limiter::AdmissionEngine;
use floodgate::store::{CounterStore, MemoryStore, RedisStore};

/// How often the in-memory store evicts expired counters.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Fixed-window admission control in front of an HTTP API.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// YAML configuration file, layered under environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override the counter store backend
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = FloodgateConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(store) = args.store {
        config.store_backend = store;
    }
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    info!("Starting Floodgate admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = connect_store(&config).await?;

    let engine = Arc::new(AdmissionEngine::from_config(store, &config)?);

    info!(
        ip_limit = config.rate_limit_ip,
        ip_window_secs = config.ip_block_duration,
        token_limit = config.rate_limit_token,
        token_window_secs = config.token_block_duration,
        token_overrides = config.tokens.len(),
        token_header = %config.token_header,
        "Admission engine initialized"
    );

    let admission = AdmissionState::new(engine.clone(), config.token_header_name()?);
    let server = HttpServer::bind(config.listen_addr(), admission).await?;

    info!("Listening on {}", server.local_addr()?);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Failed to close counter store");
    }
    served?;

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn connect_store(config: &FloodgateConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.store_backend {
        StoreBackend::Redis => {
            let redis = config.redis();
            info!(url = %redis.url(), "Connecting to Redis counter store");
            Arc::new(RedisStore::connect(redis).await?)
        }
        StoreBackend::Memory => {
            info!("Using in-memory counter store");
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(SWEEP_INTERVAL);
            store
        }
    };
    Ok(store)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

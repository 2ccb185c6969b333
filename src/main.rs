use clap::{Parser, Subcommand};
use reserve_data::adapters::{EthereumBlockchain, EthereumNode};
use reserve_data::config::{AppConfig, LoggingConfig, NonceStrategy};
use reserve_data::error::{ReserveError, Result};
use reserve_data::fetcher::{Fetcher, TickerRunner};
use reserve_data::nonce::{AutoIncreasing, NonceAllocator, NonceSource, TimeWindow};
use reserve_data::storage::MemoryStorage;
use reserve_data::ReserveData;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reserve-data")]
#[command(version)]
#[command(about = "Reserve data plane: tracks balances, rates and pending activities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "RESERVE_CONFIG_DIR")]
    config_dir: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fetcher until interrupted
    Run {
        /// Read rates from block 0 and skip the block delay
        #[arg(long)]
        simulation: bool,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;

    match cli.command.unwrap_or(Commands::Run { simulation: false }) {
        Commands::CheckConfig => {
            init_logging_simple();
            validate(&config)?;
            println!("configuration ok");
        }
        Commands::Run { simulation } => {
            let _guard = init_logging(&config.logging);
            validate(&config)?;
            run(config, simulation).await?;
        }
    }
    Ok(())
}

fn validate(config: &AppConfig) -> Result<()> {
    config.validate().map_err(|errors| {
        for e in &errors {
            error!("config: {}", e);
        }
        ReserveError::Validation(errors.join("; "))
    })
}

async fn run(mut config: AppConfig, simulation: bool) -> Result<()> {
    config.fetcher.simulation_mode |= simulation;

    let node = Arc::new(EthereumNode::connect(
        &config.node.url,
        Duration::from_millis(config.node.timeout_ms),
    )?);
    let source: Arc<dyn NonceSource> = node.clone();
    let nonce_timeout = Duration::from_millis(config.nonce.node_timeout_ms);
    let operator = config.reserve.pricing_operator;
    let pricing_nonce: Arc<dyn NonceAllocator> = match config.nonce.strategy {
        NonceStrategy::AutoIncreasing => Arc::new(AutoIncreasing::with_node_timeout(
            source,
            operator,
            nonce_timeout,
        )),
        NonceStrategy::TimeWindow => Arc::new(TimeWindow::with_window(
            source,
            operator,
            Duration::from_millis(config.nonce.window_ms),
            nonce_timeout,
        )),
    };

    let blockchain = Arc::new(EthereumBlockchain::new(
        node,
        config.reserve.wrapper_address,
        config.reserve.pricing_address,
        config.reserve.tokens.clone(),
        pricing_nonce,
    )?);
    let storage = Arc::new(MemoryStorage::with_retention(config.storage.max_versions));
    let runner = Arc::new(TickerRunner::new(config.fetcher.intervals()));

    let fetcher = Arc::new(Fetcher::new(
        storage.clone(),
        blockchain,
        runner,
        config.reserve.reserve_address,
        config.fetcher.to_fetcher_config(),
    ));
    if fetcher.exchanges().is_empty() {
        warn!("no exchange clients registered, only chain data will be fetched");
    }
    let reserve = ReserveData::new(storage, config.reserve.decimals());

    info!(
        node = %config.node.url,
        reserve = ?config.reserve.reserve_address,
        simulation = config.fetcher.simulation_mode,
        "starting reserve data"
    );
    let handles = fetcher.clone().run().await?;

    shutdown_signal().await;
    info!("shutting down");
    fetcher.stop().await?;

    // loops finish their current cycle; node calls inside are bounded
    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("poll loops did not exit within 30s");
    }

    match reserve.get_auth_data(reserve_data::time::now_ms()).await {
        Ok(latest) => info!(
            version = latest.version,
            valid = latest.data.valid,
            pending = latest.data.pending_activities.len(),
            "last auth snapshot"
        ),
        Err(e) => info!(error = %e, "no auth snapshot committed"),
    }
    info!("shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},reserve_data=debug", logging.level)));

    let log_dir = std::env::var("RESERVE_LOG_DIR")
        .ok()
        .or_else(|| logging.dir.clone());

    // `rolling::daily` panics if it cannot create the first file, so check writability first
    let mut guard = None;
    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("Warning: could not create log directory {} ({}), file logging disabled", dir, e);
            return None;
        }
        let probe = std::path::Path::new(&dir).join(".reserve_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
                let appender = tracing_appender::rolling::daily(&dir, "reserve-data.log");
                let (writer, worker) = tracing_appender::non_blocking(appender);
                guard = Some(worker);
                eprintln!("Logging to: {}/reserve-data.log", dir);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Warning: could not write to log directory {} ({}), file logging disabled", dir, e);
                None
            }
        }
    });

    let console_layer = if logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

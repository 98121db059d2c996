use clap::{Parser, Subcommand};
use prophet::adapters::{KalshiClient, PostgresStore};
use prophet::config::AppConfig;
use prophet::error::Result;
use prophet::exchange::{ExchangeClient, PaperExchange, RateLimitedGateway};
use prophet::forecast::GrokForecaster;
use prophet::persistence::Store;
use prophet::services::{StartupSync, TradingRuntime};
use prophet::strategy::{CapitalAllocator, PerformanceEvaluator};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prophet", about = "AI-driven prediction market trading bot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Use the live credential set and endpoint (default: demo)
    #[arg(long, global = true)]
    live: bool,

    /// Configuration directory
    #[arg(long, global = true, default_value = "config")]
    config_dir: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full trading loop (default)
    Run,
    /// Reconcile positions and balance against the exchange, then exit
    Sync,
    /// Produce one performance snapshot, then exit
    Evaluate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    if let Err(errors) = config.validate() {
        for message in &errors {
            eprintln!("config error: {message}");
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }

    init_logging(&config);

    if cli.live {
        warn!("live trading mode enabled, orders use real funds");
    } else {
        info!("demo mode, using demo credential set");
    }

    let store = Arc::new(
        PostgresStore::new(&config.database.url, config.database.max_connections).await?,
    );
    store.migrate().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_trading(config, store, cli.live).await?,
        Commands::Sync => run_sync(config, store, cli.live).await?,
        Commands::Evaluate => {
            let evaluator = PerformanceEvaluator::new(store);
            let snapshot = evaluator.run_cycle().await?;
            println!(
                "realized {} | unrealized {} | win rate {:.1}% | {} trades, {} open",
                snapshot.realized_pnl,
                snapshot.unrealized_pnl,
                snapshot.win_rate * 100.0,
                snapshot.total_trades,
                snapshot.open_positions
            );
        }
    }
    Ok(())
}

async fn run_trading(config: AppConfig, store: Arc<PostgresStore>, live: bool) -> Result<()> {
    let exchange = build_exchange(&config, live)?;
    let forecast = Arc::new(GrokForecaster::new(config.forecast.clone())?);
    let store: Arc<dyn Store> = store;

    let runtime = Arc::new(TradingRuntime::new(config, exchange, store, forecast));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    info!("trading runtime starting");
    if let Err(err) = runtime.run(shutdown_rx).await {
        error!(error = %err, "runtime stopped with error");
        return Err(err);
    }
    info!("trading runtime stopped");
    Ok(())
}

async fn run_sync(config: AppConfig, store: Arc<PostgresStore>, live: bool) -> Result<()> {
    let exchange = build_exchange(&config, live)?;
    let allocator = Arc::new(CapitalAllocator::new(
        config.risk.clone(),
        config.allocation.clone(),
    ));
    let store: Arc<dyn Store> = store;
    StartupSync::new(exchange, store, allocator).run().await
}

fn build_exchange(config: &AppConfig, live: bool) -> Result<Arc<dyn ExchangeClient>> {
    if config.dry_run.enabled {
        info!("dry run enabled, using in-process paper exchange");
        return Ok(Arc::new(PaperExchange::new()));
    }
    let client = KalshiClient::new(&config.exchange, live)?;
    Ok(Arc::new(RateLimitedGateway::new(
        client,
        config.exchange.rate_limit_per_sec,
        config.exchange.request_timeout_ms,
        config.exchange.max_retries,
    )))
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if let Some(directory) = &config.logging.directory {
        let appender = tracing_appender::rolling::daily(directory, "prophet.log");
        if config.logging.json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .with_ansi(false)
                .init();
        }
    } else if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

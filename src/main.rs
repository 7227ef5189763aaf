use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use snipebot::api::{ExchangeClient, MarketData, MexcClient, MexcCredentials};
use snipebot::config::Settings;
use snipebot::db::PostgresStore;
use snipebot::execution::{PositionMonitor, RateLimitedExecutor};
use snipebot::persistence::{InMemoryStore, OrderStore, PositionStore};
use snipebot::sniper::SniperEngine;

#[derive(Debug, Parser)]
#[command(name = "snipebot", version, about = "MEXC new-listing sniper")]
struct Cli {
    /// Config file (defaults to ./snipebot.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Buy SYMBOL once and schedule exits
    Snipe { symbol: String },
    /// Watch open positions until Ctrl+C
    Monitor,
    /// Query one order
    Status { symbol: String, order_id: String },
}

// ============================================================================
// Wiring
// ============================================================================

struct Stores {
    orders: Arc<dyn OrderStore>,
    positions: Arc<dyn PositionStore>,
}

struct App {
    executor: Arc<RateLimitedExecutor>,
    market: Arc<dyn MarketData>,
    stores: Stores,
    settings: Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    setup_logging(&settings);

    tracing::info!("snipebot {} starting", env!("CARGO_PKG_VERSION"));

    let app = build_app(settings).await?;

    let result = match cli.command {
        Command::Snipe { symbol } => run_snipe(&app, &symbol).await,
        Command::Monitor => run_monitor(&app).await,
        Command::Status { symbol, order_id } => run_status(&app, &symbol, &order_id).await,
    };

    app.executor.shutdown().await;
    tracing::info!("snipebot stopped");
    result
}

fn setup_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_stores(settings: &Settings) -> Result<Stores> {
    match settings.database_url.as_deref() {
        Some(url) => {
            let store = Arc::new(
                PostgresStore::connect(url)
                    .await
                    .context("Failed to connect to Postgres")?,
            );
            Ok(Stores {
                orders: store.clone(),
                positions: store,
            })
        }
        None => {
            tracing::warn!("No database_url configured, orders and positions are kept in memory");
            let store = Arc::new(InMemoryStore::new());
            Ok(Stores {
                orders: store.clone(),
                positions: store,
            })
        }
    }
}

async fn build_app(settings: Settings) -> Result<App> {
    let exchange = &settings.exchange;
    if exchange.api_key.is_empty() || exchange.api_secret.is_empty() {
        tracing::warn!("MEXC API credentials are not set; signed requests will be rejected");
    }

    let mexc = Arc::new(
        MexcClient::with_options(
            exchange.base_url.clone(),
            MexcCredentials {
                api_key: exchange.api_key.clone(),
                api_secret: exchange.api_secret.clone(),
            },
            exchange.request_timeout,
            exchange.recv_window_ms,
        )
        .context("Failed to build MEXC client")?,
    );

    let stores = connect_stores(&settings).await?;

    let client: Arc<dyn ExchangeClient> = mexc.clone();
    let executor = RateLimitedExecutor::new(client, settings.executor.clone())
        .context("Invalid executor configuration")?
        .with_order_store(Arc::clone(&stores.orders));

    Ok(App {
        executor: Arc::new(executor),
        market: mexc,
        stores,
        settings,
    })
}

// ============================================================================
// Commands
// ============================================================================

async fn run_snipe(app: &App, symbol: &str) -> Result<()> {
    let engine = SniperEngine::with_position_store(
        Arc::clone(&app.executor),
        Arc::clone(&app.market),
        Arc::clone(&app.stores.positions),
        app.settings.sniper.clone(),
    )
    .context("Invalid sniper configuration")?;
    engine.start().await;

    let cancel = CancellationToken::new();
    let result = tokio::select! {
        result = engine.execute_snipe(symbol, &cancel) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, canceling snipe...");
            cancel.cancel();
            engine.stop().await;
            return Ok(());
        }
    };

    let outcome = match result {
        Ok(order) => {
            tracing::info!(
                symbol = %order.symbol,
                order_id = %order.id,
                "Snipe placed {} {} @ {}",
                order.quantity,
                order.symbol,
                order.price
            );
            println!("{}", serde_json::to_string_pretty(&order)?);

            tokio::select! {
                _ = engine.wait_for_post_trade() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, not waiting for exit orders");
                }
            }
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Snipe of {} failed", symbol))),
    };

    engine.stop().await;
    outcome
}

async fn run_monitor(app: &App) -> Result<()> {
    let mut monitor = PositionMonitor::new(
        Arc::clone(&app.stores.positions),
        Arc::clone(&app.market),
        Arc::clone(&app.executor),
    );
    monitor.set_interval(app.settings.monitor.interval);
    monitor.start().await;

    tracing::info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Received Ctrl+C, shutting down...");

    monitor.stop().await;
    Ok(())
}

async fn run_status(app: &App, symbol: &str, order_id: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let order = tokio::select! {
        result = app.executor.get_order_status(symbol, order_id, &cancel) => {
            result.with_context(|| format!("Failed to query order {}", order_id))?
        }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&order)?);
    Ok(())
}

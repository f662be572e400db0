use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod models;
mod services;

use crate::config::AppConfig;
use crate::db::Database;
use crate::services::exchange::{Exchange, OrderFlowOrchestrator};
use crate::services::liquidity::LiquidityBot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stocksim_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting StockSim Backend v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    // Initialize the trading engine with the configured ticker universe
    let tickers = config.ticker_universe();
    anyhow::ensure!(!tickers.is_empty(), "no tickers configured");
    let symbols: Vec<&str> = tickers.iter().map(|(ticker, _)| ticker.as_str()).collect();
    let engine = Arc::new(Exchange::with_tickers(tickers.clone(), config.default_tif()));
    tracing::info!("Trading engine initialized for {:?}", symbols);

    // Connect the audit database when configured
    let pool = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            tracing::info!("Database connected");
            Some(db.pool)
        }
        None => {
            tracing::warn!("No database configured; running without the audit log");
            None
        }
    };

    let orchestrator = Arc::new(OrderFlowOrchestrator::new(Arc::clone(&engine), pool));

    // Recover users and open orders from the audit log
    match orchestrator.recover().await {
        Ok((users, orders)) => {
            if users > 0 || orders > 0 {
                tracing::info!("Recovered {} users and {} open orders", users, orders);
            } else {
                tracing::info!("No state to recover");
            }
        }
        Err(e) => {
            tracing::error!("Failed to recover state from database: {}", e);
            tracing::warn!("Starting with empty books");
        }
    }

    // Make sure the market-maker principal exists
    let maker_id = match engine.find_user(&config.market_maker_username) {
        Some(user_id) => user_id,
        None => {
            orchestrator
                .register_user(&config.market_maker_username, Decimal::ZERO, true)
                .await?
        }
    };
    tracing::info!("Market maker principal: {}", maker_id);

    // Start the trade tape worker
    // Stand-in for the downstream broadcaster; the engine never waits for it
    let mut trade_receiver = engine.subscribe_trades();
    tokio::spawn(async move {
        tracing::info!("Trade tape worker started");

        loop {
            match trade_receiver.recv().await {
                Ok(batch) => {
                    for trade in &batch.trades {
                        tracing::info!(
                            ticker = %batch.ticker,
                            price = %trade.price,
                            quantity = trade.quantity,
                            "Trade"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Trade tape lagged {} batches", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::warn!("Trade channel closed, stopping trade tape worker");
                    break;
                }
            }
        }
    });

    // Start the liquidity bot
    let bot_config = config.bot_config();
    if bot_config.enabled {
        LiquidityBot::new(Arc::clone(&orchestrator), bot_config, maker_id).spawn();
    } else {
        tracing::info!("Liquidity bot is disabled");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}

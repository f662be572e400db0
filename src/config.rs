//! Application Configuration
//!
//! Layered: built-in defaults, then an optional `config` file, then
//! `STOCKSIM_`-prefixed environment variables. Decimal-valued options are
//! carried as strings and parsed at the use site.

use crate::services::exchange::TimeInForce;
use crate::services::liquidity::LiquidityBotConfig;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub environment: String,
    /// Postgres URL for the audit log; engine-only mode when unset
    pub database_url: Option<String>,
    /// Comma-separated `TICKER:initial_price` pairs
    pub tickers: String,
    /// Fallback when an order omits its time-in-force
    pub default_tif: String,
    pub market_maker_username: String,
    pub bot_enabled: bool,
    pub bot_interval_secs: u64,
    pub bot_spread: String,
    pub bot_min_quantity: u64,
    pub bot_max_quantity: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = Config::builder()
            .set_default("environment", "development")?
            .set_default("tickers", "ACME:100.00,GLOB:250.00,NANO:10.00")?
            .set_default("default_tif", "GTC")?
            .set_default("market_maker_username", "liquidity-bot")?
            .set_default("bot_enabled", true)?
            .set_default("bot_interval_secs", 2_i64)?
            .set_default("bot_spread", "0.02")?
            .set_default("bot_min_quantity", 5_i64)?
            .set_default("bot_max_quantity", 20_i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("STOCKSIM"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// The configured ticker set with initial prices; malformed pairs are
    /// dropped
    pub fn ticker_universe(&self) -> Vec<(String, Decimal)> {
        self.tickers
            .split(',')
            .filter_map(|pair| {
                let (ticker, price) = pair.trim().split_once(':')?;
                let price = Decimal::from_str(price.trim()).ok()?;
                if price <= Decimal::ZERO {
                    return None;
                }
                Some((ticker.trim().to_uppercase(), price))
            })
            .collect()
    }

    pub fn default_tif(&self) -> TimeInForce {
        self.default_tif.parse().unwrap_or_default()
    }

    pub fn bot_config(&self) -> LiquidityBotConfig {
        LiquidityBotConfig {
            enabled: self.bot_enabled,
            interval_secs: self.bot_interval_secs.max(1),
            spread: Decimal::from_str(&self.bot_spread).unwrap_or_else(|_| Decimal::new(2, 2)),
            min_quantity: self.bot_min_quantity.max(1),
            max_quantity: self.bot_max_quantity.max(self.bot_min_quantity.max(1)),
        }
    }
}

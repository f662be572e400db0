//! Liquidity Bot
//!
//! Background market maker: on a fixed cadence, per ticker, it cancels its
//! resting quotes and reposts a two-sided market around the last trade price
//! (or the configured initial price before the first print). It goes through
//! the same orchestrator interface as clients, so its activity lands on the
//! same audit contract, and because its principal is flagged
//! `is_market_maker` it can never be starved of cash or inventory.

use crate::services::exchange::{ExchangeError, OrderFlowOrchestrator, Side, TimeInForce};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LiquidityBotConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Half-spread as a fraction of the reference price, e.g. 0.02
    pub spread: Decimal,
    pub min_quantity: u64,
    pub max_quantity: u64,
}

impl Default for LiquidityBotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 2,
            spread: Decimal::new(2, 2),
            min_quantity: 5,
            max_quantity: 20,
        }
    }
}

pub struct LiquidityBot {
    orchestrator: Arc<OrderFlowOrchestrator>,
    config: LiquidityBotConfig,
    maker_id: Uuid,
}

impl LiquidityBot {
    pub fn new(
        orchestrator: Arc<OrderFlowOrchestrator>,
        config: LiquidityBotConfig,
        maker_id: Uuid,
    ) -> Self {
        Self {
            orchestrator,
            config,
            maker_id,
        }
    }

    /// Run the quoting loop on a background task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval_secs,
                spread = %self.config.spread,
                "Liquidity bot started"
            );
            self.run().await;
        })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            interval.tick().await;
            for ticker in self.orchestrator.engine().tickers() {
                self.requote(&ticker).await;
            }
        }
    }

    /// One quoting round for one ticker: pull stale quotes, post fresh ones
    pub(crate) async fn requote(&self, ticker: &str) {
        let engine = self.orchestrator.engine();

        let resting = match engine.open_orders(ticker, self.maker_id) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(ticker, "Bot could not list its quotes: {e}");
                return;
            }
        };
        for order_id in resting {
            match self.orchestrator.cancel_order(order_id, self.maker_id).await {
                Ok(_) => {}
                // Filled between listing and cancel; nothing to pull
                Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => warn!(ticker, %order_id, "Bot failed to cancel quote: {e}"),
            }
        }

        let reference = match engine.reference_price(ticker) {
            Ok(price) => price,
            Err(e) => {
                warn!(ticker, "Bot has no reference price: {e}");
                return;
            }
        };
        let bid = (reference * (Decimal::ONE - self.config.spread)).round_dp(2);
        let ask = (reference * (Decimal::ONE + self.config.spread)).round_dp(2);

        for (side, price) in [(Side::Buy, bid), (Side::Sell, ask)] {
            if price <= Decimal::ZERO {
                continue;
            }
            let quantity =
                rand::thread_rng().gen_range(self.config.min_quantity..=self.config.max_quantity);
            if let Err(e) = self
                .orchestrator
                .place_order(
                    ticker,
                    self.maker_id,
                    side,
                    price,
                    quantity,
                    Some(TimeInForce::GTC),
                )
                .await
            {
                warn!(ticker, %side, %price, "Bot failed to quote: {e}");
            }
        }

        debug!(ticker, %reference, %bid, %ask, "Quotes refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::exchange::Exchange;
    use rust_decimal_macros::dec;

    fn bot_fixture() -> (Arc<OrderFlowOrchestrator>, LiquidityBot, Uuid) {
        let engine = Arc::new(Exchange::with_tickers(
            vec![("ACME".to_string(), dec!(100.00))],
            TimeInForce::GTC,
        ));
        let maker_id = engine.register_user("liquidity-bot", dec!(0), true).unwrap();
        let orchestrator = Arc::new(OrderFlowOrchestrator::new(engine, None));
        let config = LiquidityBotConfig {
            min_quantity: 10,
            max_quantity: 10,
            ..LiquidityBotConfig::default()
        };
        let bot = LiquidityBot::new(Arc::clone(&orchestrator), config, maker_id);
        (orchestrator, bot, maker_id)
    }

    #[tokio::test]
    async fn test_requote_posts_two_sided_market() {
        let (orchestrator, bot, maker_id) = bot_fixture();
        let engine = orchestrator.engine();

        bot.requote("ACME").await;

        // No trades yet: quotes bracket the configured initial price
        let (bid, ask) = engine.get_best("ACME").unwrap();
        assert_eq!(bid, Some(dec!(98.00)));
        assert_eq!(ask, Some(dec!(102.00)));
        assert_eq!(engine.open_orders("ACME", maker_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_requote_replaces_stale_quotes() {
        let (orchestrator, bot, maker_id) = bot_fixture();
        let engine = orchestrator.engine();

        bot.requote("ACME").await;
        let first = engine.open_orders("ACME", maker_id).unwrap();

        // A trader lifts the ask, moving the last price to 102
        let trader = engine.register_user("taker", dec!(10000), false).unwrap();
        engine
            .place_order("ACME", trader, Side::Buy, dec!(102.00), 10, None)
            .unwrap();

        bot.requote("ACME").await;
        let second = engine.open_orders("ACME", maker_id).unwrap();

        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|id| !first.contains(id)));

        // Quotes now bracket the new last price
        let (bid, ask) = engine.get_best("ACME").unwrap();
        assert_eq!(bid, Some(dec!(99.96)));
        assert_eq!(ask, Some(dec!(104.04)));
    }
}

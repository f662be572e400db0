//! Exchange Engine
//!
//! The settlement authority: owns every orderbook, the user ledger, and the
//! per-ticker serialization gates. All externally visible transitions on
//! orders and balances pass through here.
//!
//! Order placement runs escrow -> match -> settle -> remainder disposal as
//! one atomic step per ticker. Operations on different tickers run in
//! parallel; operations on the same ticker are serialized by its gate.

use super::history::{HistoryManager, HistoryStats, OrderHistoryRecord};
use super::orderbook::Orderbook;
use super::types::*;
use crate::services::accounts::{Account, AccountSnapshot, AccountsLedger};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TRADE_CHANNEL_CAPACITY: usize = 1_000;

/// One ticker's book together with its serialization gate
struct TickerBook {
    gate: Mutex<()>,
    book: Orderbook,
    initial_price: Decimal,
}

/// Engine counters snapshot
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    pub orders_accepted: u64,
    pub trades_executed: u64,
    pub orders_cancelled: u64,
}

/// The trading engine
pub struct Exchange {
    books: DashMap<String, Arc<TickerBook>>,
    ledger: AccountsLedger,
    history: HistoryManager,
    trade_sender: broadcast::Sender<TradeBatch>,
    default_tif: TimeInForce,
    orders_accepted: AtomicU64,
    trades_executed: AtomicU64,
    orders_cancelled: AtomicU64,
}

impl Exchange {
    /// Create an engine for a fixed set of tickers with their initial prices
    pub fn with_tickers(tickers: Vec<(String, Decimal)>, default_tif: TimeInForce) -> Self {
        let books = DashMap::new();
        for (ticker, initial_price) in tickers {
            books.insert(
                ticker.clone(),
                Arc::new(TickerBook {
                    gate: Mutex::new(()),
                    book: Orderbook::new(ticker),
                    initial_price,
                }),
            );
        }
        let (trade_sender, _) = broadcast::channel(TRADE_CHANNEL_CAPACITY);

        Self {
            books,
            ledger: AccountsLedger::new(),
            history: HistoryManager::new(),
            trade_sender,
            default_tif,
            orders_accepted: AtomicU64::new(0),
            trades_executed: AtomicU64::new(0),
            orders_cancelled: AtomicU64::new(0),
        }
    }

    fn ticker_book(&self, ticker: &str) -> Result<Arc<TickerBook>, ExchangeError> {
        self.books
            .get(ticker)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ExchangeError::UnknownTicker(ticker.to_string()))
    }

    // ========================================================================
    // Order placement
    // ========================================================================

    /// Place a limit order
    ///
    /// Validates, escrows, matches, settles and disposes of the remainder as
    /// one atomic step with respect to all other operations on the ticker.
    /// Every error is returned before any state has been mutated.
    pub fn place_order(
        &self,
        ticker: &str,
        user_id: Uuid,
        side: Side,
        price: Decimal,
        quantity: u64,
        time_in_force: Option<TimeInForce>,
    ) -> Result<MatchResult, ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        validate_price(price)?;
        validate_quantity(quantity)?;
        let tif = time_in_force.unwrap_or(self.default_tif);
        if !self.ledger.contains(user_id) {
            return Err(ExchangeError::UnknownUser(user_id));
        }

        let _guard = tb.gate.lock();

        // FOK feasibility is decided before any escrow is taken
        if tif == TimeInForce::FOK && !tb.book.can_fully_fill(side, price, quantity) {
            debug!(ticker, %user_id, "FOK order rejected: not fully fillable");
            return Err(ExchangeError::NotFullyFillable);
        }

        match side {
            Side::Buy => self
                .ledger
                .reserve_cash(user_id, price * Decimal::from(quantity))?,
            Side::Sell => self.ledger.reserve_shares(user_id, ticker, quantity)?,
        }

        let created_at = Utc::now();
        let mut taker = OrderEntry {
            id: Uuid::new_v4(),
            user_id,
            price,
            original_quantity: quantity,
            remaining_quantity: quantity,
            side,
            time_in_force: tif,
            sequence: tb.book.next_sequence(),
            created_at,
        };
        let order_id = taker.id;

        let fills = tb.book.match_order(&mut taker);

        let mut trades = Vec::with_capacity(fills.len());
        let mut affected_orders = Vec::with_capacity(fills.len());
        let mut affected_users = vec![user_id];

        for fill in &fills {
            self.settle_fill(ticker, &taker, fill)?;

            let (buyer_id, seller_id, buy_order_id, sell_order_id) = match side {
                Side::Buy => (user_id, fill.maker_user_id, order_id, fill.maker_order_id),
                Side::Sell => (fill.maker_user_id, user_id, fill.maker_order_id, order_id),
            };
            trades.push(TradeEvent {
                trade_id: fill.trade_id,
                ticker: ticker.to_string(),
                price: fill.price,
                quantity: fill.quantity,
                buyer_id,
                seller_id,
                buy_order_id,
                sell_order_id,
                created_at: fill.timestamp,
            });

            let maker_filled = fill.maker_original_quantity - fill.maker_remaining;
            let maker_status = if fill.maker_remaining == 0 {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            affected_orders.push(RestingOrderChange {
                order_id: fill.maker_order_id,
                user_id: fill.maker_user_id,
                filled_quantity: maker_filled,
                remaining_quantity: fill.maker_remaining,
                status: maker_status,
            });
            self.history
                .update_order(fill.maker_user_id, fill.maker_order_id, maker_filled, maker_status);
            if !affected_users.contains(&fill.maker_user_id) {
                affected_users.push(fill.maker_user_id);
            }
        }

        let filled_quantity = quantity - taker.remaining_quantity;
        let status = self.dispose_remainder(&tb, ticker, &taker, filled_quantity)?;

        self.history.record_order(
            user_id,
            OrderHistoryRecord {
                order_id,
                ticker: ticker.to_string(),
                side,
                price,
                original_quantity: quantity,
                filled_quantity,
                status,
                time_in_force: tif,
                created_at,
            },
        );
        self.history.record_trades(ticker, &trades);
        self.orders_accepted.fetch_add(1, AtomicOrdering::Relaxed);
        self.trades_executed
            .fetch_add(trades.len() as u64, AtomicOrdering::Relaxed);

        info!(
            ticker,
            order_id = %order_id,
            %side,
            %price,
            quantity,
            %status,
            filled = filled_quantity,
            "Order processed"
        );

        // Published under the gate so per-ticker event order equals
        // production order; send never blocks on subscribers.
        if !trades.is_empty() {
            let _ = self.trade_sender.send(TradeBatch {
                ticker: ticker.to_string(),
                trades: trades.clone(),
            });
        }

        Ok(MatchResult {
            order_id,
            ticker: ticker.to_string(),
            user_id,
            side,
            price,
            time_in_force: tif,
            status,
            original_quantity: quantity,
            filled_quantity,
            remaining_quantity: taker.remaining_quantity,
            trades,
            affected_orders,
            affected_users,
            created_at,
        })
    }

    /// Move cash and shares for one fill
    ///
    /// Fill price is always the resting price; the buy aggressor's escrow at
    /// its own limit is released back for the difference.
    fn settle_fill(
        &self,
        ticker: &str,
        taker: &OrderEntry,
        fill: &Fill,
    ) -> Result<(), ExchangeError> {
        let notional = fill.price * Decimal::from(fill.quantity);
        match taker.side {
            Side::Buy => {
                self.ledger.debit_reserved_cash(taker.user_id, notional)?;
                let refund = (taker.price - fill.price) * Decimal::from(fill.quantity);
                if refund > Decimal::ZERO {
                    self.ledger.release_cash(taker.user_id, refund)?;
                }
                self.ledger.credit_shares(taker.user_id, ticker, fill.quantity)?;
                self.ledger
                    .debit_reserved_shares(fill.maker_user_id, ticker, fill.quantity)?;
                self.ledger.credit_cash(fill.maker_user_id, notional)?;
            }
            Side::Sell => {
                self.ledger
                    .debit_reserved_shares(taker.user_id, ticker, fill.quantity)?;
                self.ledger.credit_cash(taker.user_id, notional)?;
                self.ledger.debit_reserved_cash(fill.maker_user_id, notional)?;
                self.ledger
                    .credit_shares(fill.maker_user_id, ticker, fill.quantity)?;
            }
        }
        Ok(())
    }

    /// Rest, cancel or reject the unmatched remainder per time-in-force and
    /// return the incoming order's final status
    fn dispose_remainder(
        &self,
        tb: &TickerBook,
        ticker: &str,
        taker: &OrderEntry,
        filled_quantity: u64,
    ) -> Result<OrderStatus, ExchangeError> {
        if taker.remaining_quantity == 0 {
            return Ok(OrderStatus::Filled);
        }
        match taker.time_in_force {
            TimeInForce::GTC => {
                tb.book.add_order(taker.clone());
                if filled_quantity == 0 {
                    Ok(OrderStatus::Open)
                } else {
                    Ok(OrderStatus::PartiallyFilled)
                }
            }
            TimeInForce::IOC => {
                match taker.side {
                    Side::Buy => self
                        .ledger
                        .release_cash(taker.user_id, taker.remaining_notional())?,
                    Side::Sell => self.ledger.release_shares(
                        taker.user_id,
                        ticker,
                        taker.remaining_quantity,
                    )?,
                }
                Ok(OrderStatus::Cancelled)
            }
            TimeInForce::FOK => {
                // The pre-check under the gate makes a FOK remainder impossible
                warn!(order_id = %taker.id, "FOK order left a remainder after matching");
                match taker.side {
                    Side::Buy => self
                        .ledger
                        .release_cash(taker.user_id, taker.remaining_notional())?,
                    Side::Sell => self.ledger.release_shares(
                        taker.user_id,
                        ticker,
                        taker.remaining_quantity,
                    )?,
                }
                Ok(OrderStatus::Cancelled)
            }
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a resting order and release its reservation in full
    pub fn cancel_order(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<CancelOutcome, ExchangeError> {
        // Resolve the owning ticker; presence is re-checked under the gate
        let tb = self
            .books
            .iter()
            .find(|entry| entry.value().book.has_order(&order_id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ExchangeError::OrderNotFound(order_id))?;

        let _guard = tb.gate.lock();

        let entry = tb
            .book
            .get_order(&order_id)
            .ok_or(ExchangeError::OrderNotFound(order_id))?;
        if entry.user_id != user_id {
            return Err(ExchangeError::Forbidden(order_id));
        }

        let entry = tb
            .book
            .remove_order(order_id)
            .ok_or(ExchangeError::OrderNotFound(order_id))?;

        let ticker = tb.book.ticker.clone();
        let (refunded_cash, refunded_shares) = match entry.side {
            Side::Buy => {
                let amount = entry.remaining_notional();
                self.ledger.release_cash(user_id, amount)?;
                (amount, 0)
            }
            Side::Sell => {
                self.ledger
                    .release_shares(user_id, &ticker, entry.remaining_quantity)?;
                (Decimal::ZERO, entry.remaining_quantity)
            }
        };

        self.history
            .update_order(user_id, order_id, entry.filled_quantity(), OrderStatus::Cancelled);
        self.orders_cancelled.fetch_add(1, AtomicOrdering::Relaxed);

        info!(%ticker, order_id = %order_id, "Order cancelled");

        Ok(CancelOutcome {
            order: entry,
            ticker,
            refunded_cash,
            refunded_shares,
        })
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Register a new user and return its id
    pub fn register_user(
        &self,
        username: &str,
        cash: Decimal,
        is_market_maker: bool,
    ) -> Result<Uuid, ExchangeError> {
        let user_id = Uuid::new_v4();
        self.ledger.register(Account::new(
            user_id,
            username.to_string(),
            cash,
            is_market_maker,
        ))?;
        info!(%user_id, username, %cash, is_market_maker, "User registered");
        Ok(user_id)
    }

    /// Load a recovered user with a known id. Startup-time only.
    pub fn load_user(&self, account: Account) -> Result<(), ExchangeError> {
        self.ledger.register(account)
    }

    /// Credit spendable shares outside the order flow (seeding, recovery)
    pub fn deposit_shares(
        &self,
        user_id: Uuid,
        ticker: &str,
        quantity: i64,
    ) -> Result<(), ExchangeError> {
        self.ledger.deposit_shares(user_id, ticker, quantity)
    }

    pub fn get_user(&self, user_id: Uuid) -> Option<AccountSnapshot> {
        self.ledger.snapshot(user_id)
    }

    /// Look up a user id by username. Startup-time convenience.
    pub fn find_user(&self, username: &str) -> Option<Uuid> {
        self.ledger.find_by_username(username)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Re-insert a persisted open order into its book without matching,
    /// re-taking its escrow. Startup-time only; callers replay orders in
    /// their original arrival order.
    #[allow(clippy::too_many_arguments)]
    pub fn restore_resting_order(
        &self,
        ticker: &str,
        order_id: Uuid,
        user_id: Uuid,
        side: Side,
        price: Decimal,
        original_quantity: u64,
        remaining_quantity: u64,
        time_in_force: TimeInForce,
        created_at: chrono::DateTime<Utc>,
    ) -> Result<(), ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        validate_price(price)?;
        validate_quantity(remaining_quantity)?;
        if !self.ledger.contains(user_id) {
            return Err(ExchangeError::UnknownUser(user_id));
        }

        let _guard = tb.gate.lock();

        match side {
            Side::Buy => self
                .ledger
                .reserve_cash(user_id, price * Decimal::from(remaining_quantity))?,
            Side::Sell => self.ledger.reserve_shares(user_id, ticker, remaining_quantity)?,
        }

        let entry = OrderEntry {
            id: order_id,
            user_id,
            price,
            original_quantity,
            remaining_quantity,
            side,
            time_in_force,
            sequence: tb.book.next_sequence(),
            created_at,
        };
        let filled = entry.filled_quantity();
        let status = if filled == 0 {
            OrderStatus::Open
        } else {
            OrderStatus::PartiallyFilled
        };
        tb.book.add_order(entry);
        self.history.record_order(
            user_id,
            OrderHistoryRecord {
                order_id,
                ticker: ticker.to_string(),
                side,
                price,
                original_quantity,
                filled_quantity: filled,
                status,
                time_in_force,
                created_at,
            },
        );
        debug!(ticker, %order_id, "Resting order restored");
        Ok(())
    }

    /// Reload a ticker's recent trade tape and last price from persisted
    /// trades, oldest first. Startup-time only.
    pub fn restore_trade_history(
        &self,
        ticker: &str,
        trades: Vec<TradeEvent>,
    ) -> Result<(), ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        if let Some(last) = trades.last() {
            tb.book.set_last_trade_price(last.price);
        }
        self.history.record_trades(ticker, &trades);
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_valid_ticker(&self, ticker: &str) -> bool {
        self.books.contains_key(ticker)
    }

    pub fn tickers(&self) -> Vec<String> {
        self.books.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Aggregated depth snapshot, taken under the ticker gate
    pub fn get_book(&self, ticker: &str, depth: usize) -> Result<BookSnapshot, ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        let _guard = tb.gate.lock();
        Ok(tb.book.snapshot(depth))
    }

    /// Best bid and ask, taken under the ticker gate
    pub fn get_best(
        &self,
        ticker: &str,
    ) -> Result<(Option<Decimal>, Option<Decimal>), ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        let _guard = tb.gate.lock();
        Ok((tb.book.best_bid(), tb.book.best_ask()))
    }

    /// Last traded price, None when nothing has printed yet
    pub fn get_last_price(&self, ticker: &str) -> Result<Option<Decimal>, ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        Ok(tb.book.last_trade_price())
    }

    /// Last traded price, falling back to the configured initial price
    pub fn reference_price(&self, ticker: &str) -> Result<Decimal, ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        Ok(tb.book.last_trade_price().unwrap_or(tb.initial_price))
    }

    /// Administratively seed the last trade price
    pub fn set_last_price(&self, ticker: &str, price: Decimal) -> Result<(), ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        validate_price(price)?;
        tb.book.set_last_trade_price(price);
        Ok(())
    }

    /// IDs of a user's resting orders on one ticker, in priority order
    pub fn open_orders(&self, ticker: &str, user_id: Uuid) -> Result<Vec<Uuid>, ExchangeError> {
        let tb = self.ticker_book(ticker)?;
        let _guard = tb.gate.lock();
        Ok(tb.book.orders_for_user(user_id))
    }

    pub fn recent_trades(&self, ticker: &str, limit: usize) -> Vec<TradeEvent> {
        self.history.recent_trades(ticker, limit)
    }

    pub fn user_orders(&self, user_id: Uuid, limit: usize) -> Vec<OrderHistoryRecord> {
        self.history.user_orders(user_id, limit)
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.history.stats()
    }

    /// Subscribe to the trade feed
    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeBatch> {
        self.trade_sender.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            orders_accepted: self.orders_accepted.load(AtomicOrdering::Relaxed),
            trades_executed: self.trades_executed.load(AtomicOrdering::Relaxed),
            orders_cancelled: self.orders_cancelled.load(AtomicOrdering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const F: &str = "FOO";
    const M: &str = "MOO";

    fn engine() -> Exchange {
        Exchange::with_tickers(
            vec![(F.to_string(), dec!(100.00)), (M.to_string(), dec!(50.00))],
            TimeInForce::GTC,
        )
    }

    /// Two users with cash=10000 and zero holdings; B seeded with shares on
    /// demand via deposit_shares
    fn engine_with_users() -> (Exchange, Uuid, Uuid) {
        let ex = engine();
        let a = ex.register_user("alice", dec!(10000), false).unwrap();
        let b = ex.register_user("bob", dec!(10000), false).unwrap();
        (ex, a, b)
    }

    fn seed_shares(ex: &Exchange, user: Uuid, ticker: &str, qty: i64) {
        ex.deposit_shares(user, ticker, qty).unwrap();
    }

    #[test]
    fn test_price_improvement_on_buy() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 10);

        ex.place_order(F, b, Side::Sell, dec!(100.00), 10, None).unwrap();
        let result = ex.place_order(F, a, Side::Buy, dec!(105.00), 10, None).unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].price, dec!(100.00));
        assert_eq!(result.trades[0].quantity, 10);
        assert_eq!(result.trades[0].buyer_id, a);
        assert_eq!(result.trades[0].seller_id, b);

        let alice = ex.get_user(a).unwrap();
        // Paid 1000, not 1050: the 50 escrow excess came back
        assert_eq!(alice.cash, dec!(9000));
        assert_eq!(alice.buying_power, dec!(9000));
        assert_eq!(alice.holdings[F].total, 10);

        let bob = ex.get_user(b).unwrap();
        assert_eq!(bob.cash, dec!(11000));
        assert_eq!(bob.holdings[F].total, 0);
    }

    #[test]
    fn test_partial_fill_rests_as_gtc() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 5);

        ex.place_order(F, b, Side::Sell, dec!(100.00), 5, None).unwrap();
        let result = ex.place_order(F, a, Side::Buy, dec!(100.00), 10, None).unwrap();

        assert_eq!(result.status, OrderStatus::PartiallyFilled);
        assert_eq!(result.filled_quantity, 5);
        assert_eq!(result.remaining_quantity, 5);
        assert_eq!(result.trades.len(), 1);

        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.cash, dec!(9500));
        assert_eq!(alice.buying_power, dec!(9000));
        assert_eq!(alice.escrowed_cash, dec!(500));
        assert_eq!(alice.holdings[F].total, 5);

        // Remainder rests at the top of the bid side
        let (best_bid, best_ask) = ex.get_best(F).unwrap();
        assert_eq!(best_bid, Some(dec!(100.00)));
        assert_eq!(best_ask, None);
    }

    #[test]
    fn test_ioc_remainder_cancelled() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 5);

        ex.place_order(F, b, Side::Sell, dec!(100.00), 5, None).unwrap();
        let result = ex
            .place_order(F, a, Side::Buy, dec!(100.00), 10, Some(TimeInForce::IOC))
            .unwrap();

        assert_eq!(result.status, OrderStatus::Cancelled);
        assert_eq!(result.filled_quantity, 5);
        assert_eq!(result.trades.len(), 1);

        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.cash, dec!(9500));
        assert_eq!(alice.buying_power, dec!(9500));
        assert_eq!(alice.escrowed_cash, dec!(0));

        let (best_bid, _) = ex.get_best(F).unwrap();
        assert_eq!(best_bid, None);
    }

    #[test]
    fn test_fok_rejection_is_a_no_op() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 5);

        ex.place_order(F, b, Side::Sell, dec!(100.00), 5, None).unwrap();
        let before = ex.get_book(F, 10).unwrap();

        let err = ex
            .place_order(F, a, Side::Buy, dec!(100.00), 10, Some(TimeInForce::FOK))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NotFullyFillable));

        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.cash, dec!(10000));
        assert_eq!(alice.escrowed_cash, dec!(0));

        let after = ex.get_book(F, 10).unwrap();
        assert_eq!(after.asks.len(), before.asks.len());
        assert_eq!(after.asks[0].quantity, 5);
        assert!(ex.recent_trades(F, 10).is_empty());
    }

    #[test]
    fn test_fok_fills_across_levels() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 11);

        ex.place_order(F, b, Side::Sell, dec!(99.00), 4, None).unwrap();
        ex.place_order(F, b, Side::Sell, dec!(100.00), 7, None).unwrap();

        let result = ex
            .place_order(F, a, Side::Buy, dec!(100.00), 11, Some(TimeInForce::FOK))
            .unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[0].price, dec!(99.00));
        assert_eq!(result.trades[1].price, dec!(100.00));
    }

    #[test]
    fn test_cancel_refunds_fully() {
        let (ex, a, _) = engine_with_users();

        let result = ex.place_order(F, a, Side::Buy, dec!(100.00), 10, None).unwrap();
        assert_eq!(result.status, OrderStatus::Open);
        assert_eq!(ex.get_user(a).unwrap().buying_power, dec!(9000));

        let outcome = ex.cancel_order(result.order_id, a).unwrap();
        assert_eq!(outcome.refunded_cash, dec!(1000));
        assert_eq!(outcome.refunded_shares, 0);
        assert_eq!(ex.get_user(a).unwrap().buying_power, dec!(10000));
        assert!(ex.recent_trades(F, 10).is_empty());

        // Second cancel finds nothing
        let err = ex.cancel_order(result.order_id, a).unwrap_err();
        assert!(matches!(err, ExchangeError::OrderNotFound(_)));
    }

    #[test]
    fn test_cancel_sell_refunds_shares() {
        let (ex, _, b) = engine_with_users();
        seed_shares(&ex, b, F, 10);

        let result = ex.place_order(F, b, Side::Sell, dec!(101.00), 10, None).unwrap();
        assert_eq!(ex.get_user(b).unwrap().holdings[F].available, 0);

        let outcome = ex.cancel_order(result.order_id, b).unwrap();
        assert_eq!(outcome.refunded_shares, 10);
        let bob = ex.get_user(b).unwrap();
        assert_eq!(bob.holdings[F].available, 10);
        assert_eq!(bob.holdings[F].escrowed, 0);
    }

    #[test]
    fn test_cancel_foreign_order_is_forbidden() {
        let (ex, a, b) = engine_with_users();

        let result = ex.place_order(F, a, Side::Buy, dec!(100.00), 10, None).unwrap();
        let err = ex.cancel_order(result.order_id, b).unwrap_err();
        assert!(matches!(err, ExchangeError::Forbidden(_)));

        // Untouched: still cancellable by its owner
        assert!(ex.cancel_order(result.order_id, a).is_ok());
    }

    #[test]
    fn test_insufficient_funds_and_shares() {
        let (ex, a, b) = engine_with_users();

        let err = ex
            .place_order(F, a, Side::Buy, dec!(100.00), 101, None)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));
        assert_eq!(ex.get_user(a).unwrap().buying_power, dec!(10000));

        let err = ex.place_order(F, b, Side::Sell, dec!(100.00), 1, None).unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientShares { .. }));
    }

    #[test]
    fn test_escrow_counts_resting_orders() {
        let (ex, a, _) = engine_with_users();

        ex.place_order(F, a, Side::Buy, dec!(60.00), 100, None).unwrap();
        // 6000 escrowed; 4100 > 4000 remaining buying power
        let err = ex.place_order(M, a, Side::Buy, dec!(41.00), 100, None).unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));
        assert!(ex.place_order(M, a, Side::Buy, dec!(40.00), 100, None).is_ok());
    }

    #[test]
    fn test_unknown_ticker_and_user_and_invalid_order() {
        let (ex, a, _) = engine_with_users();

        assert!(matches!(
            ex.place_order("NOPE", a, Side::Buy, dec!(1.00), 1, None),
            Err(ExchangeError::UnknownTicker(_))
        ));
        assert!(matches!(
            ex.place_order(F, Uuid::new_v4(), Side::Buy, dec!(1.00), 1, None),
            Err(ExchangeError::UnknownUser(_))
        ));
        assert!(matches!(
            ex.place_order(F, a, Side::Buy, dec!(0.00), 1, None),
            Err(ExchangeError::InvalidOrder(_))
        ));
        assert!(matches!(
            ex.place_order(F, a, Side::Buy, dec!(1.001), 1, None),
            Err(ExchangeError::InvalidOrder(_))
        ));
        assert!(matches!(
            ex.place_order(F, a, Side::Buy, dec!(1.00), 0, None),
            Err(ExchangeError::InvalidOrder(_))
        ));
    }

    #[test]
    fn test_fill_price_is_resting_price_selling_into_bids() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 10);

        ex.place_order(F, a, Side::Buy, dec!(102.00), 10, None).unwrap();
        let result = ex.place_order(F, b, Side::Sell, dec!(98.00), 10, None).unwrap();

        // Seller crossed down to the resting bid and earns its price
        assert_eq!(result.trades[0].price, dec!(102.00));
        let bob = ex.get_user(b).unwrap();
        assert_eq!(bob.cash, dec!(11020));
        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.cash, dec!(8980));
        assert_eq!(alice.holdings[F].total, 10);
    }

    #[test]
    fn test_cash_and_share_conservation() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 50);

        ex.place_order(F, b, Side::Sell, dec!(100.00), 30, None).unwrap();
        ex.place_order(F, b, Side::Sell, dec!(101.00), 20, None).unwrap();
        ex.place_order(F, a, Side::Buy, dec!(101.00), 45, None).unwrap();
        ex.place_order(F, a, Side::Buy, dec!(99.00), 5, None).unwrap();

        let alice = ex.get_user(a).unwrap();
        let bob = ex.get_user(b).unwrap();

        // Every fill moved exactly price*qty between the two accounts
        assert_eq!(alice.cash + bob.cash, dec!(20000));
        // Shares moved, never created: 50 split between holdings and escrow
        let alice_shares = alice.holdings.get(F).map(|h| h.total).unwrap_or(0);
        let bob_shares = bob.holdings.get(F).map(|h| h.total).unwrap_or(0);
        assert_eq!(alice_shares + bob_shares, 50);
        // Escrow consistency
        assert!(alice.buying_power >= dec!(0));
        assert!(bob.buying_power >= dec!(0));
    }

    #[test]
    fn test_status_coherence_and_last_price() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 10);

        assert_eq!(ex.get_last_price(F).unwrap(), None);
        assert_eq!(ex.reference_price(F).unwrap(), dec!(100.00));

        ex.place_order(F, b, Side::Sell, dec!(100.00), 10, None).unwrap();
        let result = ex.place_order(F, a, Side::Buy, dec!(100.00), 10, None).unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.remaining_quantity, 0);
        assert_eq!(ex.get_last_price(F).unwrap(), Some(dec!(100.00)));
        assert_eq!(ex.reference_price(F).unwrap(), dec!(100.00));

        // The filled maker is reported for the audit update
        assert_eq!(result.affected_orders.len(), 1);
        assert_eq!(result.affected_orders[0].status, OrderStatus::Filled);
        assert_eq!(result.affected_orders[0].remaining_quantity, 0);
        assert_eq!(result.affected_users.len(), 2);
    }

    #[test]
    fn test_set_last_price_admin() {
        let (ex, _, _) = engine_with_users();
        ex.set_last_price(F, dec!(123.45)).unwrap();
        assert_eq!(ex.get_last_price(F).unwrap(), Some(dec!(123.45)));
        assert!(ex.set_last_price(F, dec!(0)).is_err());
    }

    #[test]
    fn test_self_trade_is_permitted() {
        let (ex, a, _) = engine_with_users();
        seed_shares(&ex, a, F, 10);

        ex.place_order(F, a, Side::Sell, dec!(100.00), 10, None).unwrap();
        let result = ex.place_order(F, a, Side::Buy, dec!(100.00), 10, None).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].buyer_id, a);
        assert_eq!(result.trades[0].seller_id, a);

        // Net effect on the account is zero
        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.cash, dec!(10000));
        assert_eq!(alice.holdings[F].total, 10);
    }

    #[test]
    fn test_market_maker_bypass() {
        let (ex, a, _) = engine_with_users();
        let mm = ex.register_user("maker", dec!(0), true).unwrap();

        // No shares, no cash, yet both quotes go up
        ex.place_order(F, mm, Side::Sell, dec!(101.00), 10, None).unwrap();
        ex.place_order(F, mm, Side::Buy, dec!(99.00), 10, None).unwrap();

        let result = ex.place_order(F, a, Side::Buy, dec!(101.00), 10, None).unwrap();
        assert_eq!(result.trades.len(), 1);

        // Counterparty settles normally
        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.cash, dec!(8990));
        assert_eq!(alice.holdings[F].total, 10);

        // The maker ran short and was paid
        let maker = ex.get_user(mm).unwrap();
        assert_eq!(maker.cash, dec!(1010));
        assert_eq!(maker.holdings[F].total, -10);
    }

    #[test]
    fn test_trade_batch_broadcast() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 10);
        let mut receiver = ex.subscribe_trades();

        ex.place_order(F, b, Side::Sell, dec!(100.00), 10, None).unwrap();
        ex.place_order(F, a, Side::Buy, dec!(100.00), 4, None).unwrap();
        ex.place_order(F, a, Side::Buy, dec!(100.00), 6, None).unwrap();

        let first = receiver.try_recv().unwrap();
        assert_eq!(first.ticker, F);
        assert_eq!(first.trades.len(), 1);
        assert_eq!(first.trades[0].quantity, 4);

        let second = receiver.try_recv().unwrap();
        assert_eq!(second.trades[0].quantity, 6);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_open_orders_and_book_snapshot() {
        let (ex, a, _) = engine_with_users();

        let o1 = ex.place_order(F, a, Side::Buy, dec!(99.00), 5, None).unwrap();
        let o2 = ex.place_order(F, a, Side::Buy, dec!(100.00), 5, None).unwrap();

        let open = ex.open_orders(F, a).unwrap();
        assert_eq!(open, vec![o2.order_id, o1.order_id]);

        let book = ex.get_book(F, 10).unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.bids[0].price, dec!(100.00));
    }

    #[test]
    fn test_restore_resting_order() {
        let (ex, a, _) = engine_with_users();
        let order_id = Uuid::new_v4();

        ex.restore_resting_order(
            F,
            order_id,
            a,
            Side::Buy,
            dec!(100.00),
            10,
            6,
            TimeInForce::GTC,
            Utc::now(),
        )
        .unwrap();

        // Escrow was re-taken for the remainder only
        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.escrowed_cash, dec!(600));
        assert_eq!(alice.buying_power, dec!(9400));

        // The restored order matches and can be cancelled like any other
        let outcome = ex.cancel_order(order_id, a).unwrap();
        assert_eq!(outcome.refunded_cash, dec!(600));
        assert_eq!(ex.get_user(a).unwrap().buying_power, dec!(10000));
    }

    #[test]
    fn test_engine_stats() {
        let (ex, a, b) = engine_with_users();
        seed_shares(&ex, b, F, 10);

        ex.place_order(F, b, Side::Sell, dec!(100.00), 10, None).unwrap();
        ex.place_order(F, a, Side::Buy, dec!(100.00), 10, None).unwrap();
        let open = ex.place_order(F, a, Side::Buy, dec!(90.00), 1, None).unwrap();
        ex.cancel_order(open.order_id, a).unwrap();

        let stats = ex.stats();
        assert_eq!(stats.orders_accepted, 3);
        assert_eq!(stats.trades_executed, 1);
        assert_eq!(stats.orders_cancelled, 1);
    }

    #[test]
    fn test_per_ticker_concurrency() {
        let ex = std::sync::Arc::new(engine());
        let a = ex.register_user("alice", dec!(10000), false).unwrap();
        let b = ex.register_user("bob", dec!(10000), false).unwrap();
        ex.deposit_shares(b, F, 10).unwrap();
        ex.deposit_shares(b, M, 10).unwrap();

        ex.place_order(F, b, Side::Sell, dec!(100.00), 10, None).unwrap();
        ex.place_order(M, b, Side::Sell, dec!(100.00), 10, None).unwrap();

        let handles: Vec<_> = [F, M]
            .into_iter()
            .map(|ticker| {
                let ex = std::sync::Arc::clone(&ex);
                std::thread::spawn(move || {
                    ex.place_order(ticker, a, Side::Buy, dec!(100.00), 10, None)
                })
            })
            .collect();
        for handle in handles {
            let result = handle.join().unwrap().unwrap();
            assert_eq!(result.status, OrderStatus::Filled);
        }

        let alice = ex.get_user(a).unwrap();
        assert_eq!(alice.cash, dec!(8000));
        assert_eq!(alice.holdings[F].total, 10);
        assert_eq!(alice.holdings[M].total, 10);
        assert_eq!(alice.buying_power, dec!(8000));

        let bob = ex.get_user(b).unwrap();
        assert_eq!(bob.cash, dec!(12000));
        assert_eq!(bob.holdings[F].total, 0);
        assert_eq!(bob.holdings[M].total, 0);
    }
}

//! Orderbook Implementation
//!
//! Per-ticker orderbook with price-time priority and concurrent read access.

use super::types::*;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use uuid::Uuid;

/// A single ticker's orderbook
///
/// Bids and asks are price-level maps of FIFO queues. All mutation of book
/// state happens under the owning ticker's gate in the engine; the interior
/// locks make read-only queries safe from any task.
pub struct Orderbook {
    pub ticker: String,

    /// Bids keyed by price; matching iterates highest first
    bids: RwLock<BTreeMap<PriceLevel, VecDeque<OrderEntry>>>,

    /// Asks keyed by price; matching iterates lowest first
    asks: RwLock<BTreeMap<PriceLevel, VecDeque<OrderEntry>>>,

    /// Order ID to (side, price_level) mapping for O(1) cancellation
    order_index: DashMap<Uuid, (Side, PriceLevel)>,

    /// Last trade price in cents, 0 when no trade has printed yet
    last_trade_price: AtomicI64,

    /// Arrival sequence counter; the FIFO tie-breaker at equal price
    sequence: AtomicU64,

    /// Resting order count
    order_count: AtomicI64,
}

impl Orderbook {
    pub fn new(ticker: String) -> Self {
        Self {
            ticker,
            bids: RwLock::new(BTreeMap::new()),
            asks: RwLock::new(BTreeMap::new()),
            order_index: DashMap::new(),
            last_trade_price: AtomicI64::new(0),
            sequence: AtomicU64::new(0),
            order_count: AtomicI64::new(0),
        }
    }

    /// Next arrival sequence number for this book
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Get resting order count
    pub fn order_count(&self) -> i64 {
        self.order_count.load(AtomicOrdering::Relaxed)
    }

    /// Get last trade price
    pub fn last_trade_price(&self) -> Option<Decimal> {
        let raw = self.last_trade_price.load(AtomicOrdering::Relaxed);
        if raw == 0 {
            None
        } else {
            Some(Decimal::new(raw, 2))
        }
    }

    /// Set last trade price
    pub fn set_last_trade_price(&self, price: Decimal) {
        let raw = PriceLevel::from_decimal(price).raw();
        self.last_trade_price.store(raw, AtomicOrdering::Relaxed);
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        let bids = self.bids.read();
        bids.keys().next_back().map(|p| p.to_decimal())
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        let asks = self.asks.read();
        asks.keys().next().map(|p| p.to_decimal())
    }

    /// Get spread
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Add an order to the book, preserving price-time priority
    pub fn add_order(&self, entry: OrderEntry) {
        let price_level = PriceLevel::from_decimal(entry.price);
        let side = entry.side;
        let order_id = entry.id;

        match side {
            Side::Buy => {
                let mut bids = self.bids.write();
                bids.entry(price_level)
                    .or_insert_with(VecDeque::new)
                    .push_back(entry);
            }
            Side::Sell => {
                let mut asks = self.asks.write();
                asks.entry(price_level)
                    .or_insert_with(VecDeque::new)
                    .push_back(entry);
            }
        }

        self.order_index.insert(order_id, (side, price_level));
        self.order_count.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Remove an order by ID
    ///
    /// Returns the removed entry, or None when the order is not resting.
    pub fn remove_order(&self, order_id: Uuid) -> Option<OrderEntry> {
        let (side, price_level) = self.order_index.remove(&order_id)?.1;

        let entry = match side {
            Side::Buy => Self::remove_from_side(&mut self.bids.write(), price_level, order_id),
            Side::Sell => Self::remove_from_side(&mut self.asks.write(), price_level, order_id),
        };

        if entry.is_some() {
            self.order_count.fetch_sub(1, AtomicOrdering::Relaxed);
        }

        entry
    }

    fn remove_from_side(
        side: &mut BTreeMap<PriceLevel, VecDeque<OrderEntry>>,
        price_level: PriceLevel,
        order_id: Uuid,
    ) -> Option<OrderEntry> {
        let queue = side.get_mut(&price_level)?;
        let pos = queue.iter().position(|o| o.id == order_id)?;
        let entry = queue.remove(pos);
        if queue.is_empty() {
            side.remove(&price_level);
        }
        entry
    }

    /// Check if an order is resting on this book
    pub fn has_order(&self, order_id: &Uuid) -> bool {
        self.order_index.contains_key(order_id)
    }

    /// Get a resting order by ID
    pub fn get_order(&self, order_id: &Uuid) -> Option<OrderEntry> {
        let (side, price_level) = *self.order_index.get(order_id)?;

        match side {
            Side::Buy => {
                let bids = self.bids.read();
                bids.get(&price_level)?
                    .iter()
                    .find(|o| o.id == *order_id)
                    .cloned()
            }
            Side::Sell => {
                let asks = self.asks.read();
                asks.get(&price_level)?
                    .iter()
                    .find(|o| o.id == *order_id)
                    .cloned()
            }
        }
    }

    /// IDs of all resting orders owned by a user, in book priority order
    pub fn orders_for_user(&self, user_id: Uuid) -> Vec<Uuid> {
        let mut ids = Vec::new();
        {
            let bids = self.bids.read();
            for queue in bids.values().rev() {
                ids.extend(queue.iter().filter(|o| o.user_id == user_id).map(|o| o.id));
            }
        }
        {
            let asks = self.asks.read();
            for queue in asks.values() {
                ids.extend(queue.iter().filter(|o| o.user_id == user_id).map(|o| o.id));
            }
        }
        ids
    }

    /// Quantity obtainable for an order at prices satisfying the crossing
    /// check, without mutating the book. Used for the FOK pre-check.
    pub fn can_fully_fill(&self, side: Side, limit: Decimal, quantity: u64) -> bool {
        let limit_level = PriceLevel::from_decimal(limit);
        let mut available: u64 = 0;

        match side {
            Side::Buy => {
                let asks = self.asks.read();
                for (level, queue) in asks.iter() {
                    if *level > limit_level {
                        break;
                    }
                    available += queue.iter().map(|o| o.remaining_quantity).sum::<u64>();
                    if available >= quantity {
                        return true;
                    }
                }
            }
            Side::Sell => {
                let bids = self.bids.read();
                for (level, queue) in bids.iter().rev() {
                    if *level < limit_level {
                        break;
                    }
                    available += queue.iter().map(|o| o.remaining_quantity).sum::<u64>();
                    if available >= quantity {
                        return true;
                    }
                }
            }
        }

        available >= quantity
    }

    /// Match an incoming order against the contra side
    ///
    /// Walks the contra book in priority order, filling at resting prices
    /// and decrementing `taker.remaining_quantity` in place. Fully filled
    /// resting orders are removed from the book. The taker itself is never
    /// inserted here; remainder disposal is the caller's concern.
    pub fn match_order(&self, taker: &mut OrderEntry) -> Vec<Fill> {
        let mut fills = Vec::new();
        let now = chrono::Utc::now();
        let limit_level = PriceLevel::from_decimal(taker.price);

        match taker.side {
            Side::Buy => {
                let mut asks = self.asks.write();
                let price_levels: Vec<PriceLevel> = asks.keys().cloned().collect();

                for price_level in price_levels {
                    if taker.remaining_quantity == 0 || price_level > limit_level {
                        break;
                    }
                    Self::match_level(
                        &mut asks,
                        price_level,
                        taker,
                        &self.order_index,
                        &self.order_count,
                        &mut fills,
                        now,
                    );
                }
            }
            Side::Sell => {
                let mut bids = self.bids.write();
                let price_levels: Vec<PriceLevel> = bids.keys().rev().cloned().collect();

                for price_level in price_levels {
                    if taker.remaining_quantity == 0 || price_level < limit_level {
                        break;
                    }
                    Self::match_level(
                        &mut bids,
                        price_level,
                        taker,
                        &self.order_index,
                        &self.order_count,
                        &mut fills,
                        now,
                    );
                }
            }
        }

        if let Some(last) = fills.last() {
            self.set_last_trade_price(last.price);
        }

        fills
    }

    fn match_level(
        side: &mut BTreeMap<PriceLevel, VecDeque<OrderEntry>>,
        price_level: PriceLevel,
        taker: &mut OrderEntry,
        order_index: &DashMap<Uuid, (Side, PriceLevel)>,
        order_count: &AtomicI64,
        fills: &mut Vec<Fill>,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let Some(queue) = side.get_mut(&price_level) else {
            return;
        };

        while let Some(maker) = queue.front_mut() {
            if taker.remaining_quantity == 0 {
                break;
            }

            let fill_qty = taker.remaining_quantity.min(maker.remaining_quantity);

            taker.remaining_quantity -= fill_qty;
            maker.remaining_quantity -= fill_qty;

            fills.push(Fill {
                trade_id: Uuid::new_v4(),
                maker_order_id: maker.id,
                maker_user_id: maker.user_id,
                price: maker.price,
                quantity: fill_qty,
                maker_remaining: maker.remaining_quantity,
                maker_original_quantity: maker.original_quantity,
                timestamp: now,
            });

            if maker.remaining_quantity == 0 {
                let maker_id = maker.id;
                queue.pop_front();
                order_index.remove(&maker_id);
                order_count.fetch_sub(1, AtomicOrdering::Relaxed);
            }
        }

        if queue.is_empty() {
            side.remove(&price_level);
        }
    }

    /// Get an aggregated depth snapshot
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let mut bid_levels = Vec::new();
        let mut ask_levels = Vec::new();

        {
            let bids = self.bids.read();
            for (price_level, orders) in bids.iter().rev().take(depth) {
                let total: u64 = orders.iter().map(|o| o.remaining_quantity).sum();
                bid_levels.push(BookLevel {
                    price: price_level.to_decimal(),
                    quantity: total,
                });
            }
        }

        {
            let asks = self.asks.read();
            for (price_level, orders) in asks.iter().take(depth) {
                let total: u64 = orders.iter().map(|o| o.remaining_quantity).sum();
                ask_levels.push(BookLevel {
                    price: price_level.to_decimal(),
                    quantity: total,
                });
            }
        }

        BookSnapshot {
            ticker: self.ticker.clone(),
            bids: bid_levels,
            asks: ask_levels,
            last_price: self.last_trade_price(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

//! In-Memory History
//!
//! Bounded recent windows of trades per ticker and order records per user.
//! This is the cheap read path for dashboards; the durable audit log is the
//! persistence layer's contract.

use super::types::{OrderStatus, Side, TimeInForce, TradeEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

const MAX_TRADES_PER_TICKER: usize = 1_000;
const MAX_ORDERS_PER_USER: usize = 1_000;

/// One order as a user's history sees it
#[derive(Debug, Clone, Serialize)]
pub struct OrderHistoryRecord {
    pub order_id: Uuid,
    pub ticker: String,
    pub side: Side,
    pub price: Decimal,
    pub original_quantity: u64,
    pub filled_quantity: u64,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub created_at: DateTime<Utc>,
}

/// History table sizes
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistoryStats {
    pub tracked_tickers: usize,
    pub tracked_users: usize,
}

/// Recent trade and order windows
pub struct HistoryManager {
    trades: DashMap<String, RwLock<VecDeque<TradeEvent>>>,
    orders: DashMap<Uuid, RwLock<VecDeque<OrderHistoryRecord>>>,
}

impl HistoryManager {
    pub fn new() -> Self {
        Self {
            trades: DashMap::new(),
            orders: DashMap::new(),
        }
    }

    /// Record a batch of trades for a ticker
    pub fn record_trades(&self, ticker: &str, trades: &[TradeEvent]) {
        if trades.is_empty() {
            return;
        }
        let entry = self
            .trades
            .entry(ticker.to_string())
            .or_insert_with(|| RwLock::new(VecDeque::new()));
        let mut window = entry.write();
        for trade in trades {
            if window.len() == MAX_TRADES_PER_TICKER {
                window.pop_front();
            }
            window.push_back(trade.clone());
        }
    }

    /// Record a newly accepted order
    pub fn record_order(&self, user_id: Uuid, record: OrderHistoryRecord) {
        let entry = self
            .orders
            .entry(user_id)
            .or_insert_with(|| RwLock::new(VecDeque::new()));
        let mut window = entry.write();
        if window.len() == MAX_ORDERS_PER_USER {
            window.pop_front();
        }
        window.push_back(record);
    }

    /// Update an order's fill progress and status after matching or cancel
    pub fn update_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        filled_quantity: u64,
        status: OrderStatus,
    ) {
        if let Some(entry) = self.orders.get(&user_id) {
            let mut window = entry.write();
            if let Some(record) = window.iter_mut().rev().find(|r| r.order_id == order_id) {
                record.filled_quantity = filled_quantity;
                record.status = status;
            }
        }
    }

    /// Most recent trades for a ticker, newest first
    pub fn recent_trades(&self, ticker: &str, limit: usize) -> Vec<TradeEvent> {
        match self.trades.get(ticker) {
            Some(entry) => entry.read().iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// A user's most recent orders, newest first
    pub fn user_orders(&self, user_id: Uuid, limit: usize) -> Vec<OrderHistoryRecord> {
        match self.orders.get(&user_id) {
            Some(entry) => entry.read().iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            tracked_tickers: self.trades.len(),
            tracked_users: self.orders.len(),
        }
    }
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new()
    }
}

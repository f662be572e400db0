//! Exchange Engine Types
//!
//! Shared types and DTOs for the trading engine.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Price Level
// ============================================================================

/// Price level with 2 decimal precision for exact comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceLevel(i64);

impl PriceLevel {
    /// Create a PriceLevel from a Decimal price
    ///
    /// The price must already be validated to at most 2 fractional digits;
    /// anything beyond that is truncated.
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = (price * Decimal::ONE_HUNDRED).trunc();
        PriceLevel(scaled.to_i64().unwrap_or(0))
    }

    /// Convert back to Decimal
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    /// Get raw value (price in cents)
    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl Ord for PriceLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Order Types
// ============================================================================

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unrecognized side: {other}")),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good Till Cancel
    GTC,
    /// Immediate or Cancel
    IOC,
    /// Fill or Kill
    FOK,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::GTC
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::GTC => write!(f, "GTC"),
            TimeInForce::IOC => write!(f, "IOC"),
            TimeInForce::FOK => write!(f, "FOK"),
        }
    }
}

impl FromStr for TimeInForce {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GTC" => Ok(TimeInForce::GTC),
            "IOC" => Ok(TimeInForce::IOC),
            "FOK" => Ok(TimeInForce::FOK),
            other => Err(format!("unrecognized time in force: {other}")),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Order is resting with no fills
    Open,
    /// Order is resting with some fills
    PartiallyFilled,
    /// Order is completely filled
    Filled,
    /// Order was cancelled (explicitly or by IOC remainder disposal)
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::PartiallyFilled => write!(f, "partially_filled"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unrecognized order status: {other}")),
        }
    }
}

// ============================================================================
// Order Entry (in orderbook)
// ============================================================================

/// An order entry resting on (or matching against) the orderbook
#[derive(Debug, Clone)]
pub struct OrderEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub price: Decimal,
    pub original_quantity: u64,
    pub remaining_quantity: u64,
    pub side: Side,
    pub time_in_force: TimeInForce,
    /// Per-book arrival sequence; the FIFO tie-breaker at equal price
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl OrderEntry {
    pub fn filled_quantity(&self) -> u64 {
        self.original_quantity - self.remaining_quantity
    }

    pub fn is_filled(&self) -> bool {
        self.remaining_quantity == 0
    }

    /// Notional value of the remaining quantity at the limit price
    pub fn remaining_notional(&self) -> Decimal {
        self.price * Decimal::from(self.remaining_quantity)
    }
}

// ============================================================================
// Fills and Trades
// ============================================================================

/// One fill produced by the matching walk, before settlement
///
/// Buyer/seller roles are resolved by the engine from the aggressor side.
#[derive(Debug, Clone)]
pub struct Fill {
    pub trade_id: Uuid,
    pub maker_order_id: Uuid,
    pub maker_user_id: Uuid,
    /// Always the resting order's price
    pub price: Decimal,
    pub quantity: u64,
    /// Maker's remaining quantity after this fill
    pub maker_remaining: u64,
    pub maker_original_quantity: u64,
    pub timestamp: DateTime<Utc>,
}

/// A settled trade, broadcast to subscribers and persisted by the caller
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub trade_id: Uuid,
    pub ticker: String,
    pub price: Decimal,
    pub quantity: u64,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// All trades produced by one completed order placement, broadcast as a unit
#[derive(Debug, Clone, Serialize)]
pub struct TradeBatch {
    pub ticker: String,
    pub trades: Vec<TradeEvent>,
}

// ============================================================================
// Match Result
// ============================================================================

/// A resting order whose book state changed during matching
#[derive(Debug, Clone)]
pub struct RestingOrderChange {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub filled_quantity: u64,
    pub remaining_quantity: u64,
    pub status: OrderStatus,
}

/// Result of placing an order
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub order_id: Uuid,
    pub ticker: String,
    pub user_id: Uuid,
    pub side: Side,
    pub price: Decimal,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub original_quantity: u64,
    pub filled_quantity: u64,
    pub remaining_quantity: u64,
    pub trades: Vec<TradeEvent>,
    /// Resting orders that matched, for the caller's audit update
    pub affected_orders: Vec<RestingOrderChange>,
    /// Every user whose balances changed, the incoming order's owner included
    pub affected_users: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Result of cancelling an order
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub order: OrderEntry,
    pub ticker: String,
    /// Cash released back to buying power (buys)
    pub refunded_cash: Decimal,
    /// Shares released back to available holdings (sells)
    pub refunded_shares: u64,
}

// ============================================================================
// Orderbook Snapshot
// ============================================================================

/// One aggregated price level of a book snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: u64,
}

/// Orderbook depth snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub ticker: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub last_price: Option<Decimal>,
    pub timestamp: i64,
}

// ============================================================================
// Error Types
// ============================================================================

/// Trading engine errors
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("Unknown ticker: {0}")]
    UnknownTicker(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Unknown user: {0}")]
    UnknownUser(Uuid),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient shares of {ticker}: required {required}, available {available}")]
    InsufficientShares {
        ticker: String,
        required: u64,
        available: i64,
    },

    #[error("Fill-or-kill order not fully fillable")]
    NotFullyFillable,

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Order {0} is not owned by the requesting user")]
    Forbidden(Uuid),
}

// ============================================================================
// Validation
// ============================================================================

/// Check that a price is strictly positive with at most 2 fractional digits
pub fn validate_price(price: Decimal) -> Result<(), ExchangeError> {
    if price <= Decimal::ZERO {
        return Err(ExchangeError::InvalidOrder(format!(
            "price must be positive, got {price}"
        )));
    }
    if price.round_dp(2) != price {
        return Err(ExchangeError::InvalidOrder(format!(
            "price must have at most 2 decimal places, got {price}"
        )));
    }
    Ok(())
}

/// Check that a quantity is strictly positive
pub fn validate_quantity(quantity: u64) -> Result<(), ExchangeError> {
    if quantity == 0 {
        return Err(ExchangeError::InvalidOrder(
            "quantity must be positive".to_string(),
        ));
    }
    Ok(())
}

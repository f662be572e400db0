#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Persisted order row
///
/// Side, status and time-in-force are stored as text and read back through
/// the engine enums' FromStr impls.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ticker: String,
    pub side: String,
    pub price: Decimal,
    pub original_quantity: i64,
    pub filled_quantity: i64,
    pub status: String,
    pub time_in_force: String,
    pub created_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn remaining_quantity(&self) -> i64 {
        self.original_quantity - self.filled_quantity
    }
}

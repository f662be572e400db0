#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Persisted user row. Cash is the total balance (spendable + escrowed);
/// escrow is reconstructed at startup from the user's open orders.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub cash: Decimal,
    pub is_market_maker: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted holding row, one per (user, ticker) with nonzero shares
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HoldingRow {
    pub user_id: Uuid,
    pub ticker: String,
    pub quantity: i64,
}

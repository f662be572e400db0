//! Order Flow Orchestrator
//!
//! The engine's persistence collaborator. The engine itself never touches the
//! database; this wrapper runs an engine call and then, within a single
//! request-scoped transaction, records the incoming order, every trade, every
//! resting order whose quantity changed, and the final balances of every
//! affected user - committing exactly once per request.
//!
//! Without a configured database the orchestrator degrades to engine-only
//! operation, which is what tests and ephemeral runs use.

use super::engine::Exchange;
use super::types::*;
use crate::models::{HoldingRow, OrderRow, TradeRow, UserRow};
use crate::services::accounts::{Account, AccountSnapshot};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct OrderFlowOrchestrator {
    engine: Arc<Exchange>,
    pool: Option<PgPool>,
}

impl OrderFlowOrchestrator {
    pub fn new(engine: Arc<Exchange>, pool: Option<PgPool>) -> Self {
        if pool.is_none() {
            warn!("Orchestrator running without a database (engine-only mode)");
        }
        Self { engine, pool }
    }

    pub fn engine(&self) -> &Arc<Exchange> {
        &self.engine
    }

    // ========================================================================
    // Order flow
    // ========================================================================

    /// Place an order and commit its audit record
    ///
    /// The engine result is authoritative; a failed audit commit is logged
    /// and does not undo the in-memory settlement.
    pub async fn place_order(
        &self,
        ticker: &str,
        user_id: Uuid,
        side: Side,
        price: Decimal,
        quantity: u64,
        time_in_force: Option<TimeInForce>,
    ) -> Result<MatchResult, ExchangeError> {
        let result = self
            .engine
            .place_order(ticker, user_id, side, price, quantity, time_in_force)?;

        if let Some(pool) = &self.pool {
            if let Err(e) = self.persist_placement(pool, &result).await {
                error!(order_id = %result.order_id, "Failed to persist order placement: {e}");
            }
        }

        Ok(result)
    }

    /// Cancel an order and commit its audit record
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<CancelOutcome, ExchangeError> {
        let outcome = self.engine.cancel_order(order_id, user_id)?;

        if let Some(pool) = &self.pool {
            if let Err(e) = self.persist_cancellation(pool, order_id, user_id).await {
                error!(%order_id, "Failed to persist cancellation: {e}");
            }
        }

        Ok(outcome)
    }

    /// Register a user and persist the fresh account
    pub async fn register_user(
        &self,
        username: &str,
        cash: Decimal,
        is_market_maker: bool,
    ) -> Result<Uuid, ExchangeError> {
        let user_id = self.engine.register_user(username, cash, is_market_maker)?;

        if let Some(pool) = &self.pool {
            if let Some(snapshot) = self.engine.get_user(user_id) {
                let mut tx = match pool.begin().await {
                    Ok(tx) => tx,
                    Err(e) => {
                        error!(%user_id, "Failed to persist registration: {e}");
                        return Ok(user_id);
                    }
                };
                if let Err(e) = Self::upsert_user(&mut tx, &snapshot).await {
                    error!(%user_id, "Failed to persist registration: {e}");
                } else if let Err(e) = tx.commit().await {
                    error!(%user_id, "Failed to commit registration: {e}");
                }
            }
        }

        Ok(user_id)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn persist_placement(
        &self,
        pool: &PgPool,
        result: &MatchResult,
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, ticker, side, price, original_quantity, filled_quantity, status, time_in_force, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                filled_quantity = $7,
                status = $8,
                updated_at = NOW()
            "#,
        )
        .bind(result.order_id)
        .bind(result.user_id)
        .bind(&result.ticker)
        .bind(result.side.to_string())
        .bind(result.price)
        .bind(result.original_quantity as i64)
        .bind(result.filled_quantity as i64)
        .bind(result.status.to_string())
        .bind(result.time_in_force.to_string())
        .bind(result.created_at)
        .execute(&mut *tx)
        .await?;

        for trade in &result.trades {
            sqlx::query(
                r#"
                INSERT INTO trades (id, ticker, price, quantity, buyer_id, seller_id, buy_order_id, sell_order_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(trade.trade_id)
            .bind(&trade.ticker)
            .bind(trade.price)
            .bind(trade.quantity as i64)
            .bind(trade.buyer_id)
            .bind(trade.seller_id)
            .bind(trade.buy_order_id)
            .bind(trade.sell_order_id)
            .bind(trade.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for change in &result.affected_orders {
            sqlx::query(
                r#"
                UPDATE orders
                SET filled_quantity = $1, status = $2, updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(change.filled_quantity as i64)
            .bind(change.status.to_string())
            .bind(change.order_id)
            .execute(&mut *tx)
            .await?;
        }

        for user_id in &result.affected_users {
            if let Some(snapshot) = self.engine.get_user(*user_id) {
                Self::upsert_user(&mut tx, &snapshot).await?;
            }
        }

        tx.commit().await?;
        debug!(order_id = %result.order_id, trades = result.trades.len(), "Placement persisted");
        Ok(())
    }

    async fn persist_cancellation(
        &self,
        pool: &PgPool,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(OrderStatus::Cancelled.to_string())
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        if let Some(snapshot) = self.engine.get_user(user_id) {
            Self::upsert_user(&mut tx, &snapshot).await?;
        }

        tx.commit().await?;
        debug!(%order_id, "Cancellation persisted");
        Ok(())
    }

    async fn upsert_user(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        snapshot: &AccountSnapshot,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, cash, is_market_maker)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                cash = $3,
                updated_at = NOW()
            "#,
        )
        .bind(snapshot.user_id)
        .bind(&snapshot.username)
        .bind(snapshot.cash)
        .bind(snapshot.is_market_maker)
        .execute(&mut **tx)
        .await?;

        for (ticker, holding) in &snapshot.holdings {
            sqlx::query(
                r#"
                INSERT INTO holdings (user_id, ticker, quantity)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id, ticker) DO UPDATE SET quantity = $3
                "#,
            )
            .bind(snapshot.user_id)
            .bind(ticker)
            .bind(holding.total)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    // ========================================================================
    // Startup recovery
    // ========================================================================

    /// Materialize users and open orders from the database into the engine.
    /// Runs once before trading; the engine never re-reads the database.
    pub async fn recover(&self) -> anyhow::Result<(usize, usize)> {
        let Some(pool) = &self.pool else {
            return Ok((0, 0));
        };

        let users: Vec<UserRow> = sqlx::query_as(
            "SELECT id, username, cash, is_market_maker, created_at, updated_at FROM users",
        )
        .fetch_all(pool)
        .await?;

        for user in &users {
            self.engine.load_user(Account::new(
                user.id,
                user.username.clone(),
                user.cash,
                user.is_market_maker,
            ))?;
        }

        let holdings: Vec<HoldingRow> =
            sqlx::query_as("SELECT user_id, ticker, quantity FROM holdings")
                .fetch_all(pool)
                .await?;
        for holding in &holdings {
            self.engine
                .deposit_shares(holding.user_id, &holding.ticker, holding.quantity)?;
        }

        let open_orders: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, ticker, side, price, original_quantity, filled_quantity, status, time_in_force, created_at
            FROM orders
            WHERE status IN ('open', 'partially_filled')
            ORDER BY created_at
            "#,
        )
        .fetch_all(pool)
        .await?;

        let recent_trades: Vec<TradeRow> = sqlx::query_as(
            r#"
            SELECT id, ticker, price, quantity, buyer_id, seller_id, buy_order_id, sell_order_id, created_at
            FROM trades
            ORDER BY created_at DESC
            LIMIT 1000
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut tapes: std::collections::HashMap<String, Vec<TradeEvent>> =
            std::collections::HashMap::new();
        for row in recent_trades.into_iter().rev() {
            tapes.entry(row.ticker.clone()).or_default().push(TradeEvent {
                trade_id: row.id,
                ticker: row.ticker,
                price: row.price,
                quantity: row.quantity as u64,
                buyer_id: row.buyer_id,
                seller_id: row.seller_id,
                buy_order_id: row.buy_order_id,
                sell_order_id: row.sell_order_id,
                created_at: row.created_at,
            });
        }
        for (ticker, tape) in tapes {
            if let Err(e) = self.engine.restore_trade_history(&ticker, tape) {
                warn!(%ticker, "Skipping trade tape: {e}");
            }
        }

        let mut restored = 0;
        for order in &open_orders {
            let (Ok(side), Ok(tif)) = (
                order.side.parse::<Side>(),
                order.time_in_force.parse::<TimeInForce>(),
            ) else {
                warn!(order_id = %order.id, "Skipping open order with unreadable side/tif");
                continue;
            };
            match self.engine.restore_resting_order(
                &order.ticker,
                order.id,
                order.user_id,
                side,
                order.price,
                order.original_quantity as u64,
                order.remaining_quantity() as u64,
                tif,
                order.created_at,
            ) {
                Ok(()) => restored += 1,
                Err(e) => warn!(order_id = %order.id, "Skipping open order: {e}"),
            }
        }

        info!(users = users.len(), orders = restored, "State recovered from database");
        Ok((users.len(), restored))
    }
}

//! Database Bootstrap
//!
//! Connection pool plus idempotent schema initialization for the audit log.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    /// Connect and make sure the audit tables exist
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                username TEXT NOT NULL,
                cash NUMERIC NOT NULL,
                is_market_maker BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS holdings (
                user_id UUID NOT NULL REFERENCES users(id),
                ticker TEXT NOT NULL,
                quantity BIGINT NOT NULL,
                PRIMARY KEY (user_id, ticker)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                ticker TEXT NOT NULL,
                side TEXT NOT NULL,
                price NUMERIC NOT NULL,
                original_quantity BIGINT NOT NULL,
                filled_quantity BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                time_in_force TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id UUID PRIMARY KEY,
                ticker TEXT NOT NULL,
                price NUMERIC NOT NULL,
                quantity BIGINT NOT NULL,
                buyer_id UUID NOT NULL,
                seller_id UUID NOT NULL,
                buy_order_id UUID NOT NULL,
                sell_order_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_user ON orders (user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_ticker ON trades (ticker, created_at)")
            .execute(&self.pool)
            .await?;

        info!("Database schema ready");
        Ok(())
    }
}

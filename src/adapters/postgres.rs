use crate::error::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// PostgreSQL connection pool shared by the lock and idempotency stores.
///
/// Advisory-lock leases pin a connection each for the whole cycle, so the
/// pool needs at least one connection per concurrently held lock on top of
/// what the key table queries use.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool (zero-cost reuse)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        debug!("PostgreSQL ping ok");
        Ok(())
    }

    /// Live and expired idempotency records, for operator reports
    pub async fn idempotency_key_counts(&self) -> Result<(i64, i64)> {
        let (live, expired): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE expires_at > NOW()),
                COUNT(*) FILTER (WHERE expires_at <= NOW())
            FROM idempotency_keys
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((live, expired))
    }

    /// Close every pooled connection (and with them any session locks)
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}

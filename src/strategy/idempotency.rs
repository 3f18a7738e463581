use crate::adapters::postgres::PostgresStore;
use crate::coordination::LockGuard;
use crate::domain::Timeframe;
use crate::error::{CycleGuardError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default lifetime of a marked key
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Identity of "this action on this candle".
///
/// Renders as `{ticker}-{timeframe}-{candle_timestamp}-{action}`, e.g.
/// `KRW-BTC-1h-1704067200-buy`. External tooling reads that text out of the
/// store, so the format is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    ticker: String,
    timeframe: String,
    candle_timestamp: i64,
    action: String,
    rendered: String,
}

impl IdempotencyKey {
    pub fn new(
        ticker: impl Into<String>,
        timeframe: impl Into<String>,
        candle_timestamp: i64,
        action: impl Into<String>,
    ) -> Self {
        let ticker = ticker.into();
        let timeframe = timeframe.into();
        let action = action.into();
        let rendered = make_key(&ticker, &timeframe, candle_timestamp, &action);

        Self {
            ticker,
            timeframe,
            candle_timestamp,
            action,
            rendered,
        }
    }

    /// Key for the candle of `timeframe` that contains `at`
    pub fn for_candle(ticker: &str, timeframe: Timeframe, at: DateTime<Utc>, action: &str) -> Self {
        Self::new(ticker, timeframe.as_str(), timeframe.align(at), action)
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn candle_timestamp(&self) -> i64 {
        self.candle_timestamp
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

/// Render an idempotency key string
pub fn make_key(ticker: &str, timeframe: &str, candle_timestamp: i64, action: &str) -> String {
    format!("{}-{}-{}-{}", ticker, timeframe, candle_timestamp, action)
}

/// Storage for marked keys.
///
/// "Not found" is `Ok(false)`, never an error. Inserting a key that is
/// already live must succeed without changing it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether a record for `key` exists with `expires_at > now`
    async fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Insert a record; a live duplicate is left alone, an expired one is replaced
    async fn insert(&self, key: &str, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()>;

    /// Delete every record with `expires_at <= now`, returning how many went
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Total records, expired or not
    async fn count(&self) -> Result<u64>;
}

/// Postgres-backed key table (`idempotency_keys`)
#[derive(Clone)]
pub struct PgIdempotencyStore {
    store: PostgresStore,
}

impl PgIdempotencyStore {
    pub fn new(store: PostgresStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM idempotency_keys
                WHERE key = $1 AND expires_at > $2
            )
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_one(self.store.pool())
        .await?;

        Ok(found)
    }

    async fn insert(&self, key: &str, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, created_at, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_keys.expires_at <= EXCLUDED.created_at
            "#,
        )
        .bind(key)
        .bind(created_at)
        .bind(expires_at)
        .execute(self.store.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            // Another runner inserted the same key between our check and mark.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!("Idempotency key {} inserted concurrently", key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(self.store.pool())
            .await?;

        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM idempotency_keys")
            .fetch_one(self.store.pool())
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryRecord {
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Process-local key table for single-runner setups and tests
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, MemoryRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, expired or not
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .await
            .get(key)
            .is_some_and(|r| r.expires_at > now))
    }

    async fn insert(&self, key: &str, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get(key) {
            Some(existing) if existing.expires_at > created_at => {
                debug!("Idempotency key {} already live", key);
            }
            _ => {
                records.insert(
                    key.to_string(),
                    MemoryRecord {
                        created_at,
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok((before - records.len()) as u64)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.lock().await.len() as u64)
    }
}

/// Exactly-once bookkeeping for candle/action pairs.
///
/// The guard itself only reports storage errors; deciding to fail closed on
/// them is the caller's job. Under real concurrency the surrounding cycle
/// lock, not this guard, keeps two runners from both passing `check_key`.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    default_ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            default_ttl: Duration::hours(DEFAULT_TTL_HOURS),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn postgres(store: PostgresStore) -> Self {
        Self::new(Arc::new(PgIdempotencyStore::new(store)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryIdempotencyStore::new()))
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// True iff a live record for `key` exists
    pub async fn check_key(&self, key: &str) -> Result<bool> {
        self.check_key_at(key, Utc::now()).await
    }

    pub async fn check_key_at(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let exists = self.store.exists(key, now).await?;
        debug!("Idempotency check {}: exists={}", key, exists);
        Ok(exists)
    }

    /// Record `key` as done for `ttl`
    pub async fn mark_key(&self, key: &str, ttl: Duration) -> Result<()> {
        self.mark_key_at(key, ttl, Utc::now()).await
    }

    /// Record `key` with the guard's default TTL
    pub async fn mark_key_default(&self, key: &str) -> Result<()> {
        self.mark_key(key, self.default_ttl).await
    }

    pub async fn mark_key_at(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<()> {
        if ttl <= Duration::zero() {
            return Err(CycleGuardError::Validation(format!(
                "idempotency ttl must be positive, got {}s",
                ttl.num_seconds()
            )));
        }

        self.store.insert(key, now, now + ttl).await?;
        debug!("Marked idempotency key {} (ttl {}h)", key, ttl.num_hours());
        Ok(())
    }

    /// Delete expired records. Meant for the periodic sweep, not the cycle path.
    ///
    /// # Returns
    /// Number of records deleted
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.cleanup_expired_at(Utc::now()).await
    }

    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_expired(now).await?;

        if deleted > 0 {
            info!("Cleaned up {} expired idempotency keys", deleted);
        }

        Ok(deleted)
    }

    /// Check, and mark if absent. Returns whether the key already existed.
    ///
    /// The two steps are not atomic against another process, so this only
    /// accepts callers holding the lock named by the key's action.
    pub async fn check_and_mark(&self, lock: &LockGuard, key: &str, ttl: Duration) -> Result<bool> {
        if !lock.acquired() {
            return Err(CycleGuardError::Lock(format!(
                "check_and_mark for {} requires holding lock {}",
                key,
                lock.name()
            )));
        }

        let action = key.rsplit('-').next().unwrap_or_default();
        if action != lock.name().as_str() {
            return Err(CycleGuardError::Lock(format!(
                "key {} is not covered by lock {}",
                key,
                lock.name()
            )));
        }

        if self.check_key(key).await? {
            return Ok(true);
        }

        self.mark_key(key, ttl).await?;
        Ok(false)
    }

    /// Total stored records, for diagnostics
    pub async fn record_count(&self) -> Result<u64> {
        self.store.count().await
    }
}

//! Cross-process cycle locks
//!
//! Every cycle kind maps to one fixed advisory-lock id. Runners on any number
//! of hosts contend for that id in the shared store; whoever holds it runs
//! the cycle. Holder death must free the lock without anyone calling
//! `release`: the Postgres backend ties the lock to a dedicated session, the
//! in-memory backend ties it to the lease value's lifetime.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{CycleGuardError, Result};

/// Advisory metadata attached to a lease when the caller gives none
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

/// Named cycle locks.
///
/// The integer ids are shared with every deployed runner and with whatever
/// else lives in the same advisory-lock id space. Never renumber them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    TradingCycle,
    PositionManagement,
}

impl LockName {
    pub const ALL: [LockName; 2] = [LockName::TradingCycle, LockName::PositionManagement];

    pub fn id(&self) -> i64 {
        match self {
            LockName::TradingCycle => 1001,
            LockName::PositionManagement => 1002,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::TradingCycle => "trading_cycle",
            LockName::PositionManagement => "position_management",
        }
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LockName {
    type Err = CycleGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trading_cycle" => Ok(LockName::TradingCycle),
            "position_management" => Ok(LockName::PositionManagement),
            other => Err(CycleGuardError::Lock(format!("unknown lock name: {}", other))),
        }
    }
}

/// Proof of holding one lock id in a backend.
///
/// Dropping a lease without calling `release` must still free the lock
/// (possibly asynchronously, e.g. when the server notices the closed session).
#[async_trait]
pub trait LockLease: Send {
    fn lock_id(&self) -> i64;

    async fn release(self: Box<Self>) -> Result<()>;
}

/// Shared store that arbitrates lock ids between processes
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take the lock if free, `None` if someone else holds it
    async fn try_acquire(&self, lock_id: i64) -> Result<Option<Box<dyn LockLease>>>;

    /// Wait until the lock is free, then take it
    async fn acquire(&self, lock_id: i64) -> Result<Box<dyn LockLease>>;

    /// Whether anyone currently holds the lock. Diagnostics only.
    async fn is_locked(&self, lock_id: i64) -> Result<bool>;
}

// ==================== Postgres ====================

/// Session-scoped Postgres advisory locks.
///
/// Each lease pins one pooled connection for as long as the lock is held.
/// `pg_advisory_unlock` returns it to the pool; a lease dropped without
/// release detaches and closes its connection, and the server frees every
/// lock that session held.
#[derive(Clone)]
pub struct PgAdvisoryLockBackend {
    pool: PgPool,
}

impl PgAdvisoryLockBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PgAdvisoryLease {
    lock_id: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl PgAdvisoryLease {
    async fn connect(pool: &PgPool, lock_id: i64) -> Result<Self> {
        Ok(Self {
            lock_id,
            conn: Some(pool.acquire().await?),
        })
    }

    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>> {
        self.conn
            .as_mut()
            .ok_or_else(|| CycleGuardError::Lock("lease connection already released".to_string()))
    }

    /// Give the connection back without closing it (only valid when no lock is held)
    fn into_pooled(mut self) {
        drop(self.conn.take());
    }
}

#[async_trait]
impl LockLease for PgAdvisoryLease {
    fn lock_id(&self) -> i64 {
        self.lock_id
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(
                    "pg_advisory_unlock({}) reported lock not held by this session",
                    self.lock_id
                );
                Ok(())
            }
            Err(e) => {
                // Closing the session is the only remaining way to free the lock.
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for PgAdvisoryLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                "Advisory lock {} dropped without release, closing its session",
                self.lock_id
            );
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl LockBackend for PgAdvisoryLockBackend {
    async fn try_acquire(&self, lock_id: i64) -> Result<Option<Box<dyn LockLease>>> {
        // The lease owns the connection before the query runs so a cancelled
        // future still closes the session if the server granted the lock.
        let mut lease = PgAdvisoryLease::connect(&self.pool, lock_id).await?;

        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut **lease.conn()?)
            .await?;

        if acquired {
            Ok(Some(Box::new(lease)))
        } else {
            lease.into_pooled();
            Ok(None)
        }
    }

    async fn acquire(&self, lock_id: i64) -> Result<Box<dyn LockLease>> {
        let mut lease = PgAdvisoryLease::connect(&self.pool, lock_id).await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock_id)
            .execute(&mut **lease.conn()?)
            .await?;

        Ok(Box::new(lease))
    }

    async fn is_locked(&self, lock_id: i64) -> Result<bool> {
        // Single-bigint advisory keys are split across classid/objid with objsubid = 1.
        let locked = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND granted
                  AND database = (SELECT oid FROM pg_database WHERE datname = current_database())
                  AND classid = (($1::bigint >> 32) & 4294967295)::oid
                  AND objid = ($1::bigint & 4294967295)::oid
                  AND objsubid = 1
            )
            "#,
        )
        .bind(lock_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(locked)
    }
}

// ==================== In-memory ====================

#[derive(Default)]
struct MemoryLocks {
    held: std::sync::Mutex<HashSet<i64>>,
    released: Notify,
}

impl MemoryLocks {
    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, lock_id: i64) -> bool {
        self.held().insert(lock_id)
    }

    fn free(&self, lock_id: i64) {
        self.held().remove(&lock_id);
        self.released.notify_waiters();
    }
}

/// Process-local lock table with the same contract as the Postgres backend.
///
/// Only excludes runners that share this value (clone it to share). Suitable
/// for single-process deployments and tests.
#[derive(Clone, Default)]
pub struct InMemoryLockBackend {
    locks: Arc<MemoryLocks>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryLease {
    lock_id: i64,
    locks: Arc<MemoryLocks>,
}

#[async_trait]
impl LockLease for MemoryLease {
    fn lock_id(&self) -> i64 {
        self.lock_id
    }

    async fn release(self: Box<Self>) -> Result<()> {
        // Drop frees the slot.
        Ok(())
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.locks.free(self.lock_id);
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, lock_id: i64) -> Result<Option<Box<dyn LockLease>>> {
        if self.locks.take(lock_id) {
            Ok(Some(Box::new(MemoryLease {
                lock_id,
                locks: self.locks.clone(),
            })))
        } else {
            Ok(None)
        }
    }

    async fn acquire(&self, lock_id: i64) -> Result<Box<dyn LockLease>> {
        loop {
            let notified = self.locks.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.locks.take(lock_id) {
                return Ok(Box::new(MemoryLease {
                    lock_id,
                    locks: self.locks.clone(),
                }));
            }

            notified.await;
        }
    }

    async fn is_locked(&self, lock_id: i64) -> Result<bool> {
        Ok(self.locks.held().contains(&lock_id))
    }
}

// ==================== Coordinator ====================

struct HeldLock {
    lease: Box<dyn LockLease>,
    acquired_at: Instant,
    timeout: Duration,
}

/// Named-lock front end over a [`LockBackend`].
///
/// `acquire`/`release` track leases by name inside this coordinator, so a
/// coordinator counts as a single holder: a second `acquire` of a name it
/// already holds returns `false`. `lock` hands the lease to a scoped
/// [`LockGuard`] instead.
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    held: Mutex<HashMap<LockName, HeldLock>>,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Coordinator over Postgres advisory locks
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Arc::new(PgAdvisoryLockBackend::new(pool)))
    }

    /// Coordinator over a fresh process-local lock table
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLockBackend::new()))
    }

    async fn take_lease(&self, name: LockName, blocking: bool) -> Result<Option<Box<dyn LockLease>>> {
        if blocking {
            self.backend.acquire(name.id()).await.map(Some)
        } else {
            self.backend.try_acquire(name.id()).await
        }
    }

    /// Try to take `name`.
    ///
    /// Non-blocking mode returns `Ok(false)` straight away when the lock is
    /// held elsewhere (or already by this coordinator). `timeout_secs` is
    /// recorded and reported on overrun; it never forces a release.
    pub async fn acquire(&self, name: LockName, timeout_secs: u64, blocking: bool) -> Result<bool> {
        if self.held.lock().await.contains_key(&name) {
            debug!("Lock {} already held by this coordinator", name);
            return Ok(false);
        }

        let Some(lease) = self.take_lease(name, blocking).await? else {
            debug!("Lock {} (id {}) is held elsewhere", name, name.id());
            return Ok(false);
        };

        let mut held = self.held.lock().await;
        if held.contains_key(&name) {
            // Lost a race against a concurrent acquire on this coordinator.
            drop(held);
            lease.release().await?;
            return Ok(false);
        }
        held.insert(
            name,
            HeldLock {
                lease,
                acquired_at: Instant::now(),
                timeout: Duration::from_secs(timeout_secs),
            },
        );

        info!("Acquired lock {} (id {})", name, name.id());
        Ok(true)
    }

    /// Non-blocking acquire with the default advisory timeout
    pub async fn try_acquire(&self, name: LockName) -> Result<bool> {
        self.acquire(name, DEFAULT_LOCK_TIMEOUT_SECS, false).await
    }

    /// Release `name` if this coordinator holds it; otherwise do nothing.
    pub async fn release(&self, name: LockName) -> Result<()> {
        let Some(held) = self.held.lock().await.remove(&name) else {
            debug!("Release of {} ignored: not held by this coordinator", name);
            return Ok(());
        };

        report_overrun(name, held.acquired_at, held.timeout);
        held.lease.release().await?;
        info!("Released lock {}", name);
        Ok(())
    }

    /// Whether anyone holds `name`. Checking and then acting on this is racy;
    /// use it for diagnostics, never to gate work.
    pub async fn is_locked(&self, name: LockName) -> Result<bool> {
        self.backend.is_locked(name.id()).await
    }

    /// Scoped acquisition. The guard reports whether the lock was obtained and
    /// frees it on `release` or, failing that, when dropped.
    pub async fn lock(&self, name: LockName, timeout_secs: u64, blocking: bool) -> Result<LockGuard> {
        let lease = self.take_lease(name, blocking).await?;
        if lease.is_some() {
            info!("Acquired scoped lock {} (id {})", name, name.id());
        } else {
            debug!("Scoped lock {} not acquired", name);
        }

        Ok(LockGuard {
            name,
            lease,
            acquired_at: Instant::now(),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn report_overrun(name: LockName, acquired_at: Instant, timeout: Duration) {
    let held_for = acquired_at.elapsed();
    if held_for > timeout {
        warn!(
            "Lock {} held for {:.1}s, past its {}s advisory timeout",
            name,
            held_for.as_secs_f64(),
            timeout.as_secs()
        );
    }
}

/// Result of [`LockCoordinator::lock`].
///
/// Holding an acquired guard is what licenses the non-atomic
/// check-then-mark helpers on the idempotency guard.
pub struct LockGuard {
    name: LockName,
    lease: Option<Box<dyn LockLease>>,
    acquired_at: Instant,
    timeout: Duration,
}

impl LockGuard {
    /// Did this guard get the lock?
    pub fn acquired(&self) -> bool {
        self.lease.is_some()
    }

    pub fn name(&self) -> LockName {
        self.name
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release the lock now. A no-op for a guard that never acquired.
    pub async fn release(mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };

        report_overrun(self.name, self.acquired_at, self.timeout);
        lease.release().await?;
        info!("Released scoped lock {}", self.name);
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.lease.is_some() {
            warn!("Scoped lock {} dropped without explicit release", self.name);
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("acquired", &self.acquired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ids_are_fixed() {
        assert_eq!(LockName::TradingCycle.id(), 1001);
        assert_eq!(LockName::PositionManagement.id(), 1002);
        assert_eq!(
            "position_management".parse::<LockName>().unwrap(),
            LockName::PositionManagement
        );
    }

    #[test]
    fn test_lock_ids_are_unique() {
        let ids: HashSet<i64> = LockName::ALL.iter().map(|n| n.id()).collect();
        assert_eq!(ids.len(), LockName::ALL.len());
    }

    #[tokio::test]
    async fn test_second_acquire_fails_until_release() {
        let coordinator = LockCoordinator::in_memory();

        assert!(coordinator.try_acquire(LockName::TradingCycle).await.unwrap());
        assert!(!coordinator.try_acquire(LockName::TradingCycle).await.unwrap());

        coordinator.release(LockName::TradingCycle).await.unwrap();
        assert!(coordinator.try_acquire(LockName::TradingCycle).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_of_unheld_lock_is_noop() {
        let coordinator = LockCoordinator::in_memory();
        coordinator.release(LockName::PositionManagement).await.unwrap();
        assert!(!coordinator.is_locked(LockName::PositionManagement).await.unwrap());
    }

    #[tokio::test]
    async fn test_locks_are_independent() {
        let coordinator = LockCoordinator::in_memory();
        assert!(coordinator.try_acquire(LockName::TradingCycle).await.unwrap());
        assert!(coordinator.try_acquire(LockName::PositionManagement).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_frees_lock() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let coordinator = LockCoordinator::new(backend.clone());

        {
            let guard = coordinator.lock(LockName::TradingCycle, 600, false).await.unwrap();
            assert!(guard.acquired());
            assert!(backend.is_locked(1001).await.unwrap());
        }

        assert!(!backend.is_locked(1001).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_release() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let first = LockCoordinator::new(backend.clone());
        let second = Arc::new(LockCoordinator::new(backend));

        assert!(first.try_acquire(LockName::TradingCycle).await.unwrap());

        let waiter = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire(LockName::TradingCycle, 60, true).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.release(LockName::TradingCycle).await.unwrap();
        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(acquired);
    }
}

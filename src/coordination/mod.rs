//! Coordination between runners
//!
//! Cross-process mutual exclusion for the periodic cycles:
//! - Named advisory locks with fixed ids
//! - Postgres session-scoped and in-memory backends
//! - Scoped guards that release on every exit path

pub mod lock;

pub use lock::{
    InMemoryLockBackend, LockBackend, LockCoordinator, LockGuard, LockLease, LockName,
    PgAdvisoryLockBackend, DEFAULT_LOCK_TIMEOUT_SECS,
};

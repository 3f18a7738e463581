use crate::domain::{CycleResult, CycleStatus};
use crate::error::CycleErrorKind;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::info;

/// Outcome counters for the cycle orchestrator.
///
/// Lock contention and duplicates have their own counters and never touch
/// `cycles_failed`.
pub struct CycleMetrics {
    /// Cycles that ran the pipeline to completion
    pub cycles_succeeded: AtomicU64,
    /// Duplicate candle/action pairs, plus pipeline-level skips
    pub cycles_skipped: AtomicU64,
    /// Ticks that found the cycle lock held elsewhere
    pub lock_contention: AtomicU64,
    /// Cycles refused because the duplicate check failed
    pub cycles_blocked: AtomicU64,
    /// Pipeline failures, timeouts, panics and lock-store errors
    pub cycles_failed: AtomicU64,
    /// BUY/SELL decisions the validator downgraded to HOLD
    pub validator_overrides: AtomicU64,
    /// Successful cycles whose key could not be marked
    pub mark_failures: AtomicU64,
    /// Expired keys removed by the sweeper
    pub keys_swept: AtomicU64,
    /// Unix time of the last recorded cycle
    last_cycle_at: AtomicI64,
}

impl CycleMetrics {
    pub fn new() -> Self {
        Self {
            cycles_succeeded: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            lock_contention: AtomicU64::new(0),
            cycles_blocked: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            validator_overrides: AtomicU64::new(0),
            mark_failures: AtomicU64::new(0),
            keys_swept: AtomicU64::new(0),
            last_cycle_at: AtomicI64::new(0),
        }
    }

    /// Count one finished cycle
    pub fn record(&self, result: &CycleResult) {
        let counter = match (result.status, result.error_kind) {
            (CycleStatus::Success, _) => &self.cycles_succeeded,
            (CycleStatus::Skipped, _) => &self.cycles_skipped,
            (CycleStatus::Blocked, _) => &self.cycles_blocked,
            (CycleStatus::Failed, Some(CycleErrorKind::LockUnavailable)) => &self.lock_contention,
            (CycleStatus::Failed, _) => &self.cycles_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if result.error_kind == Some(CycleErrorKind::ValidationOverride) {
            self.validator_overrides.fetch_add(1, Ordering::Relaxed);
        }

        self.last_cycle_at
            .store(result.finished_at.timestamp(), Ordering::Relaxed);
    }

    pub fn inc_mark_failures(&self) {
        self.mark_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_keys_swept(&self, n: u64) {
        self.keys_swept.fetch_add(n, Ordering::Relaxed);
    }

    /// Seconds since the last recorded cycle, `None` before the first one
    pub fn seconds_since_last_cycle(&self) -> Option<i64> {
        match self.last_cycle_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(Utc::now().timestamp() - at),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "cycles ok={} skipped={} contended={} blocked={} failed={} | overrides={} mark_failures={} swept={}",
            self.cycles_succeeded.load(Ordering::Relaxed),
            self.cycles_skipped.load(Ordering::Relaxed),
            self.lock_contention.load(Ordering::Relaxed),
            self.cycles_blocked.load(Ordering::Relaxed),
            self.cycles_failed.load(Ordering::Relaxed),
            self.validator_overrides.load(Ordering::Relaxed),
            self.mark_failures.load(Ordering::Relaxed),
            self.keys_swept.load(Ordering::Relaxed),
        )
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self) -> String {
        format!(
            r#"# HELP cycleguard_cycles_succeeded_total Cycles that ran the pipeline to completion
# TYPE cycleguard_cycles_succeeded_total counter
cycleguard_cycles_succeeded_total {}

# HELP cycleguard_cycles_skipped_total Cycles skipped as duplicates or by the pipeline
# TYPE cycleguard_cycles_skipped_total counter
cycleguard_cycles_skipped_total {}

# HELP cycleguard_lock_contention_total Ticks that found the cycle lock held
# TYPE cycleguard_lock_contention_total counter
cycleguard_lock_contention_total {}

# HELP cycleguard_cycles_blocked_total Cycles blocked by a failed duplicate check
# TYPE cycleguard_cycles_blocked_total counter
cycleguard_cycles_blocked_total {}

# HELP cycleguard_cycles_failed_total Cycles that failed
# TYPE cycleguard_cycles_failed_total counter
cycleguard_cycles_failed_total {}

# HELP cycleguard_validator_overrides_total Decisions downgraded to hold
# TYPE cycleguard_validator_overrides_total counter
cycleguard_validator_overrides_total {}

# HELP cycleguard_mark_failures_total Idempotency marks that failed after a successful cycle
# TYPE cycleguard_mark_failures_total counter
cycleguard_mark_failures_total {}

# HELP cycleguard_keys_swept_total Expired idempotency keys removed
# TYPE cycleguard_keys_swept_total counter
cycleguard_keys_swept_total {}
"#,
            self.cycles_succeeded.load(Ordering::Relaxed),
            self.cycles_skipped.load(Ordering::Relaxed),
            self.lock_contention.load(Ordering::Relaxed),
            self.cycles_blocked.load(Ordering::Relaxed),
            self.cycles_failed.load(Ordering::Relaxed),
            self.validator_overrides.load(Ordering::Relaxed),
            self.mark_failures.load(Ordering::Relaxed),
            self.keys_swept.load(Ordering::Relaxed),
        )
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!("{}", self.summary());
    }
}

impl Default for CycleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

//! Expired idempotency key sweep
//!
//! Runs `cleanup_expired` on a fixed interval, off the cycle hot path. Sweep
//! errors are logged and retried on the next tick; they never stop the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::SweeperConfig;
use crate::error::Result;
use crate::services::CycleMetrics;
use crate::strategy::IdempotencyGuard;

pub struct IdempotencySweeper {
    guard: Arc<IdempotencyGuard>,
    metrics: Arc<CycleMetrics>,
    interval: Duration,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl IdempotencySweeper {
    pub fn new(guard: Arc<IdempotencyGuard>, metrics: Arc<CycleMetrics>, config: &SweeperConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            guard,
            metrics,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Run one sweep now
    pub async fn sweep_once(&self) -> Result<u64> {
        let removed = self.guard.cleanup_expired().await?;
        self.metrics.add_keys_swept(removed);
        Ok(removed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the periodic sweep. The first sweep runs immediately.
    pub fn start(&self) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Idempotency sweeper started (interval: {}s)", self.interval.as_secs());

        let guard = self.guard.clone();
        let metrics = self.metrics.clone();
        let running = self.running.clone();
        let interval = self.interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                match guard.cleanup_expired().await {
                    Ok(removed) => {
                        metrics.add_keys_swept(removed);
                        debug!("Sweep removed {} expired keys", removed);
                    }
                    Err(e) => error!("Idempotency sweep failed: {}", e),
                }
            }

            running.store(false, Ordering::SeqCst);
            info!("Idempotency sweeper stopped");
        })
    }

    /// Stop the periodic sweep; an in-flight sweep finishes first
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::InMemoryIdempotencyStore;
    use chrono::{Duration as ChronoDuration, Utc};

    #[tokio::test]
    async fn test_sweep_once_counts_removed_keys() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = Arc::new(IdempotencyGuard::new(store.clone()));
        let metrics = Arc::new(CycleMetrics::new());
        let past = Utc::now() - ChronoDuration::hours(3);

        guard.mark_key_at("stale", ChronoDuration::hours(1), past).await.unwrap();
        guard.mark_key("live", ChronoDuration::hours(1)).await.unwrap();

        let sweeper = IdempotencySweeper::new(guard, metrics.clone(), &SweeperConfig::default());
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(store.keys().await, vec!["live".to_string()]);
        assert_eq!(metrics.keys_swept.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_background_sweep_stops_on_request() {
        let guard = Arc::new(IdempotencyGuard::in_memory());
        let past = Utc::now() - ChronoDuration::hours(3);
        guard.mark_key_at("stale", ChronoDuration::hours(1), past).await.unwrap();

        let metrics = Arc::new(CycleMetrics::new());
        let sweeper = IdempotencySweeper::new(guard.clone(), metrics, &SweeperConfig { interval_secs: 3600 });
        let handle = sweeper.start();

        // The first tick fires immediately.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while guard.record_count().await.unwrap() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        sweeper.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!sweeper.is_running());
    }
}

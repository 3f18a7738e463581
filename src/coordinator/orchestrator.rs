//! CycleOrchestrator: one safe run of a periodic cycle
//!
//! Sequence per invocation:
//!   1. Non-blocking acquire of the cycle lock (busy ⇒ `failed`, nothing else runs)
//!   2. Idempotency key for the current candle, checked fail-closed
//!   3. Pipeline under a wall-clock budget (errors, panics, overruns ⇒ `failed`)
//!   4. Best-effort mark of the key
//!   5. Release of the lock on every path that acquired it
//!
//! Steps 2-5 run in their own task: dropping the caller's future (shutdown)
//! neither interrupts the release nor frees the lock while the pipeline is
//! still running.

use chrono::{Duration as ChronoDuration, Utc};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CycleConfig;
use crate::coordination::{LockCoordinator, LockGuard};
use crate::domain::cycle::CycleResultBuilder;
use crate::domain::{CycleKind, CycleResult, Timeframe};
use crate::error::{CycleErrorKind, CycleGuardError};
use crate::services::CycleMetrics;
use crate::strategy::{
    IdempotencyGuard, IdempotencyKey, NoopCallbacks, Pipeline, PipelineCallbacks,
    PipelineContext, PipelineOutput, PipelineStatus,
};

/// Runs trading and position-management cycles. Cheap to clone.
#[derive(Clone)]
pub struct CycleOrchestrator {
    locks: Arc<LockCoordinator>,
    idempotency: Arc<IdempotencyGuard>,
    pipeline: Arc<dyn Pipeline>,
    config: CycleConfig,
    metrics: Arc<CycleMetrics>,
    callbacks: Arc<dyn PipelineCallbacks>,
}

impl CycleOrchestrator {
    pub fn new(
        locks: Arc<LockCoordinator>,
        idempotency: Arc<IdempotencyGuard>,
        pipeline: Arc<dyn Pipeline>,
        config: CycleConfig,
    ) -> Self {
        Self {
            locks,
            idempotency,
            pipeline,
            config,
            metrics: Arc::new(CycleMetrics::new()),
            callbacks: Arc::new(NoopCallbacks),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Callbacks handed to every pipeline run
    pub fn with_callbacks(mut self, callbacks: Arc<dyn PipelineCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn metrics(&self) -> &Arc<CycleMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// One trading cycle for `ticker` on the configured timeframe
    #[instrument(skip(self), fields(cycle = "trading_cycle"))]
    pub async fn run_cycle(&self, ticker: &str) -> CycleResult {
        let result = self
            .run(CycleKind::Trading, ticker, self.config.timeframe)
            .await;
        self.metrics.record(&result);
        result
    }

    /// One position-management pass, keyed on the position timeframe
    #[instrument(skip(self), fields(cycle = "position_management"))]
    pub async fn run_position_management(&self) -> CycleResult {
        let ticker = self.config.position_ticker.clone();
        let result = self
            .run(CycleKind::PositionManagement, &ticker, self.config.position_timeframe)
            .await;
        self.metrics.record(&result);
        result
    }

    async fn run(&self, kind: CycleKind, ticker: &str, timeframe: Timeframe) -> CycleResult {
        let builder = CycleResultBuilder::new(kind, ticker);
        let lock_name = kind.lock_name();

        let guard = match self
            .locks
            .lock(lock_name, self.config.lock_timeout_secs, false)
            .await
        {
            Ok(guard) if guard.acquired() => guard,
            Ok(_) => {
                info!("Lock {} held by another runner, skipping {} cycle", lock_name, kind);
                return builder.failed(Some("lock not acquired"), None, CycleErrorKind::LockUnavailable);
            }
            Err(e) => {
                error!("Lock store error acquiring {}: {}", lock_name, e);
                return builder.failed(
                    Some("lock not acquired"),
                    Some(format!("lock acquisition failed: {}", e)),
                    CycleErrorKind::LockStorage,
                );
            }
        };

        debug!("Cycle {} holds lock {}", builder.cycle_id(), lock_name);

        let this = self.clone();
        let held_builder = builder.clone();
        let ticker = ticker.to_string();
        let held = tokio::spawn(async move {
            this.run_held(guard, held_builder, kind, ticker, timeframe)
                .await
        });

        match held.await {
            Ok(result) => result,
            Err(e) => {
                // The guard was dropped while unwinding, which frees the lock.
                error!("Cycle {} task died: {}", builder.cycle_id(), describe_join_error(e));
                builder.failed(
                    None,
                    Some("cycle task terminated unexpectedly".to_string()),
                    CycleErrorKind::Pipeline,
                )
            }
        }
    }

    /// Everything between acquire and release
    async fn run_held(
        self,
        guard: LockGuard,
        mut builder: CycleResultBuilder,
        kind: CycleKind,
        ticker: String,
        timeframe: Timeframe,
    ) -> CycleResult {
        let key = IdempotencyKey::for_candle(&ticker, timeframe, Utc::now(), kind.action_tag());
        builder.set_key(key.to_string());

        let result = match self.idempotency.check_key(key.as_str()).await {
            Err(e) => {
                error!("Idempotency check for {} failed, blocking cycle: {}", key, e);
                builder.blocked(
                    format!("idempotency check failed: {}", e),
                    CycleErrorKind::IdempotencyStorage,
                )
            }
            Ok(true) => {
                info!("Duplicate candle/action {}, skipping", key);
                builder.skipped("duplicate candle/action", Some(CycleErrorKind::DuplicateDetected))
            }
            Ok(false) => self.run_pipeline(&builder, &ticker, kind, &key).await,
        };

        let lock_name = guard.name();
        if let Err(e) = guard.release().await {
            error!("Failed to release lock {}: {}", lock_name, e);
        }

        info!(
            "Cycle {} finished: status={} decision={}",
            result.cycle_id, result.status, result.decision
        );
        result
    }

    async fn run_pipeline(
        &self,
        builder: &CycleResultBuilder,
        ticker: &str,
        kind: CycleKind,
        key: &IdempotencyKey,
    ) -> CycleResult {
        let ctx = PipelineContext {
            ticker: ticker.to_string(),
            trading_type: kind,
            callbacks: self.callbacks.clone(),
        };

        let output = match self.execute_bounded(ctx).await {
            Ok(output) => output,
            Err(e) => {
                error!("Pipeline for {} failed: {}", ticker, e);
                return builder.failed(None, Some(e), CycleErrorKind::Pipeline);
            }
        };

        match output.status {
            PipelineStatus::Success => {
                self.mark(key).await;
                if output.decision.is_overridden() {
                    warn!("Cycle {} completed with validator override: {}", key, output.decision.reason);
                }
                builder.success(output.decision, output.trade_id)
            }
            PipelineStatus::Skipped => {
                self.mark(key).await;
                builder.skipped(&output.decision.reason, None)
            }
            PipelineStatus::Failed => {
                let error = output
                    .error
                    .unwrap_or_else(|| "pipeline reported failure".to_string());
                error!("Pipeline for {} reported failure: {}", ticker, error);
                builder.failed(None, Some(error), CycleErrorKind::Pipeline)
            }
        }
    }

    /// Run the pipeline in its own task so a panic or overrun becomes an error
    async fn execute_bounded(&self, ctx: PipelineContext) -> std::result::Result<PipelineOutput, String> {
        let budget_secs = self.config.pipeline_timeout_secs;
        let pipeline = self.pipeline.clone();
        let mut task = tokio::spawn(async move { pipeline.execute(ctx).await });

        match tokio::time::timeout(Duration::from_secs(budget_secs), &mut task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) => Err(describe_join_error(e)),
            Err(_) => {
                // Nothing may keep trading once the lock is released. Abort only
                // lands at the next yield point, so wait for the task to end.
                task.abort();
                if let Err(e) = (&mut task).await {
                    if e.is_panic() {
                        warn!("Timed-out pipeline panicked while stopping: {}", describe_join_error(e));
                    }
                }
                Err(CycleGuardError::Timeout(budget_secs).to_string())
            }
        }
    }

    /// Best-effort: an unmarked key after a completed run only risks a retry
    async fn mark(&self, key: &IdempotencyKey) {
        let ttl = ChronoDuration::hours(self.config.idempotency_ttl_hours);
        if let Err(e) = self.idempotency.mark_key(key.as_str(), ttl).await {
            warn!("Failed to mark idempotency key {}: {}", key, e);
            self.metrics.inc_mark_failures();
        }
    }
}

fn describe_join_error(e: JoinError) -> String {
    if e.is_panic() {
        format!("task panicked: {}", panic_message(e.into_panic()))
    } else {
        format!("task cancelled: {}", e)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{InMemoryLockBackend, LockBackend, LockName};
    use crate::domain::{Action, Confidence, CycleStatus, Decision};
    use crate::error::Result;
    use crate::strategy::idempotency::MockIdempotencyStore;
    use crate::strategy::pipeline::MockPipeline;
    use crate::strategy::{IdempotencyStore, InMemoryIdempotencyStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn buy() -> Decision {
        Decision::new(Action::Buy, Confidence::Score(85.0), "momentum")
    }

    fn orchestrator_with(
        backend: Arc<InMemoryLockBackend>,
        store: Arc<dyn IdempotencyStore>,
        pipeline: Arc<dyn Pipeline>,
        config: CycleConfig,
    ) -> CycleOrchestrator {
        CycleOrchestrator::new(
            Arc::new(LockCoordinator::new(backend)),
            Arc::new(IdempotencyGuard::new(store)),
            pipeline,
            config,
        )
    }

    fn succeeding_pipeline() -> MockPipeline {
        let mut pipeline = MockPipeline::new();
        pipeline
            .expect_execute()
            .times(1)
            .returning(|_| Ok(PipelineOutput::success(buy(), Some("t-1".into()))));
        pipeline
    }

    fn current_key(kind: CycleKind, ticker: &str, timeframe: Timeframe) -> String {
        IdempotencyKey::for_candle(ticker, timeframe, Utc::now(), kind.action_tag()).to_string()
    }

    struct SlowPipeline;

    #[async_trait]
    impl Pipeline for SlowPipeline {
        async fn execute(&self, _ctx: PipelineContext) -> Result<PipelineOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(PipelineOutput::success(buy(), None))
        }
    }

    /// Blocks its worker thread, so abort cannot interrupt it
    struct BlockingPipeline {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Pipeline for BlockingPipeline {
        async fn execute(&self, _ctx: PipelineContext) -> Result<PipelineOutput> {
            std::thread::sleep(Duration::from_millis(2500));
            self.finished.store(true, Ordering::SeqCst);
            Ok(PipelineOutput::success(buy(), None))
        }
    }

    struct FlaggingPipeline {
        delay: Duration,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Pipeline for FlaggingPipeline {
        async fn execute(&self, _ctx: PipelineContext) -> Result<PipelineOutput> {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(PipelineOutput::success(buy(), Some("t-2".into())))
        }
    }

    struct PanickingPipeline;

    #[async_trait]
    impl Pipeline for PanickingPipeline {
        async fn execute(&self, _ctx: PipelineContext) -> Result<PipelineOutput> {
            panic!("exchange client poisoned");
        }
    }

    #[tokio::test]
    async fn test_success_marks_key_and_releases_lock() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let orch = orchestrator_with(
            backend.clone(),
            store.clone(),
            Arc::new(succeeding_pipeline()),
            CycleConfig::default(),
        );

        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Success);
        assert_eq!(result.decision, Action::Buy);
        assert_eq!(result.trade_id.as_deref(), Some("t-1"));
        let key = result.idempotency_key.clone().unwrap();
        assert!(key.starts_with("KRW-BTC-1h-"));
        assert!(key.ends_with("-trading_cycle"));
        assert_eq!(store.keys().await, vec![key]);
        assert!(!backend.is_locked(LockName::TradingCycle.id()).await.unwrap());
        assert_eq!(orch.metrics().cycles_succeeded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_duplicate_skips_pipeline() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let config = CycleConfig::default();
        let key = current_key(CycleKind::Trading, "KRW-BTC", config.timeframe);
        store
            .insert(&key, Utc::now(), Utc::now() + ChronoDuration::hours(24))
            .await
            .unwrap();

        let mut pipeline = MockPipeline::new();
        pipeline.expect_execute().times(0);

        let orch = orchestrator_with(
            Arc::new(InMemoryLockBackend::new()),
            store,
            Arc::new(pipeline),
            config,
        );
        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Skipped);
        assert_eq!(result.reason.as_deref(), Some("duplicate candle/action"));
        assert_eq!(result.idempotency_key.as_deref(), Some(key.as_str()));
        assert!(!result.should_alert());
        assert_eq!(orch.metrics().cycles_failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_fails_fast() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let other = LockCoordinator::new(backend.clone());
        assert!(other.try_acquire(LockName::TradingCycle).await.unwrap());

        let mut store = MockIdempotencyStore::new();
        store.expect_exists().times(0);
        let mut pipeline = MockPipeline::new();
        pipeline.expect_execute().times(0);

        let orch = orchestrator_with(backend.clone(), Arc::new(store), Arc::new(pipeline), CycleConfig::default());
        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Failed);
        assert_eq!(result.reason.as_deref(), Some("lock not acquired"));
        assert_eq!(result.error_kind, Some(CycleErrorKind::LockUnavailable));
        assert!(result.idempotency_key.is_none());
        // Still held by the other runner.
        assert!(backend.is_locked(LockName::TradingCycle.id()).await.unwrap());
        assert_eq!(orch.metrics().lock_contention.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_storage_error_blocks_cycle() {
        let mut store = MockIdempotencyStore::new();
        store
            .expect_exists()
            .returning(|_, _| Err(CycleGuardError::IdempotencyStorage("connection reset".into())));
        let mut pipeline = MockPipeline::new();
        pipeline.expect_execute().times(0);

        let backend = Arc::new(InMemoryLockBackend::new());
        let orch = orchestrator_with(backend.clone(), Arc::new(store), Arc::new(pipeline), CycleConfig::default());
        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Blocked);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .starts_with("idempotency check failed: "));
        assert!(result.should_alert());
        assert!(!backend.is_locked(LockName::TradingCycle.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pipeline_error_fails_with_hold_and_leaves_key_unmarked() {
        let mut pipeline = MockPipeline::new();
        pipeline
            .expect_execute()
            .returning(|_| Err(CycleGuardError::MarketDataUnavailable("no candles".into())));

        let store = Arc::new(InMemoryIdempotencyStore::new());
        let backend = Arc::new(InMemoryLockBackend::new());
        let orch = orchestrator_with(backend.clone(), store.clone(), Arc::new(pipeline), CycleConfig::default());
        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Failed);
        assert_eq!(result.decision, Action::Hold);
        assert!(result.error.unwrap().contains("no candles"));
        assert!(store.keys().await.is_empty());
        assert!(!backend.is_locked(LockName::TradingCycle.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pipeline_panic_becomes_failed_result() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let orch = orchestrator_with(
            backend.clone(),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(PanickingPipeline),
            CycleConfig::default(),
        );
        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Failed);
        assert!(result.error.unwrap().contains("exchange client poisoned"));
        assert!(!backend.is_locked(LockName::TradingCycle.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pipeline_timeout_becomes_failed_result() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let config = CycleConfig {
            pipeline_timeout_secs: 1,
            ..CycleConfig::default()
        };
        let orch = orchestrator_with(
            backend.clone(),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(SlowPipeline),
            config,
        );
        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Failed);
        assert!(result.error.unwrap().contains("Timed out after 1s"));
        assert!(!backend.is_locked(LockName::TradingCycle.id()).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_pipeline_finishes_before_lock_release() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let finished = Arc::new(AtomicBool::new(false));
        let config = CycleConfig {
            pipeline_timeout_secs: 1,
            ..CycleConfig::default()
        };
        let orch = orchestrator_with(
            backend.clone(),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(BlockingPipeline {
                finished: finished.clone(),
            }),
            config,
        );

        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Failed);
        assert!(result.error.unwrap().contains("Timed out after 1s"));
        assert!(finished.load(Ordering::SeqCst));
        assert!(!backend.is_locked(LockName::TradingCycle.id()).await.unwrap());

        let second = LockCoordinator::new(backend.clone());
        assert!(second.try_acquire(LockName::TradingCycle).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_caller_keeps_lock_until_pipeline_ends() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let finished = Arc::new(AtomicBool::new(false));
        let orch = orchestrator_with(
            backend.clone(),
            store.clone(),
            Arc::new(FlaggingPipeline {
                delay: Duration::from_millis(400),
                finished: finished.clone(),
            }),
            CycleConfig::default(),
        );

        let cancelled = tokio::time::timeout(Duration::from_millis(50), orch.run_cycle("KRW-BTC")).await;
        assert!(cancelled.is_err());

        assert!(backend.is_locked(LockName::TradingCycle.id()).await.unwrap());
        assert!(!finished.load(Ordering::SeqCst));

        let mut released = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !backend.is_locked(LockName::TradingCycle.id()).await.unwrap() {
                released = true;
                break;
            }
        }
        assert!(released);
        assert!(finished.load(Ordering::SeqCst));
        // The held section ran to completion and recorded the candle.
        assert_eq!(store.keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_failure_does_not_fail_cycle() {
        let mut store = MockIdempotencyStore::new();
        store.expect_exists().returning(|_, _| Ok(false));
        store
            .expect_insert()
            .returning(|_, _, _| Err(CycleGuardError::IdempotencyStorage("disk full".into())));

        let orch = orchestrator_with(
            Arc::new(InMemoryLockBackend::new()),
            Arc::new(store),
            Arc::new(succeeding_pipeline()),
            CycleConfig::default(),
        );
        let result = orch.run_cycle("KRW-BTC").await;

        assert_eq!(result.status, CycleStatus::Success);
        assert_eq!(orch.metrics().mark_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_position_management_uses_its_own_lock_and_key() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let other = LockCoordinator::new(backend.clone());
        assert!(other.try_acquire(LockName::TradingCycle).await.unwrap());

        let mut pipeline = MockPipeline::new();
        pipeline
            .expect_execute()
            .withf(|ctx| ctx.trading_type == CycleKind::PositionManagement && ctx.ticker == "portfolio")
            .returning(|_| Ok(PipelineOutput::skipped("no open positions")));

        let store = Arc::new(InMemoryIdempotencyStore::new());
        let orch = orchestrator_with(backend, store.clone(), Arc::new(pipeline), CycleConfig::default());
        let result = orch.run_position_management().await;

        assert_eq!(result.status, CycleStatus::Skipped);
        assert_eq!(result.reason.as_deref(), Some("no open positions"));
        let key = result.idempotency_key.unwrap();
        assert!(key.starts_with("portfolio-15m-"));
        assert!(key.ends_with("-position_management"));
        assert_eq!(store.keys().await, vec![key]);
    }
}

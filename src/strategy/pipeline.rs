//! Decision pipeline boundary
//!
//! The orchestrator treats a [`Pipeline`] as a black box: it hands over a
//! context, gets back a structured output, and never sees an order being
//! placed. [`OraclePipeline`] is the stock implementation: market snapshot,
//! oracle call, validator, then (for BUY/SELL only) the exchange.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{CycleKind, Decision, Indicators, MarketConditions};
use crate::error::Result;
use crate::validation::{generate_report, DecisionValidator, ValidationResult};

// ============================================================================
// Boundary types
// ============================================================================

/// Observer hooks for a pipeline run. Every hook defaults to a no-op.
pub trait PipelineCallbacks: Send + Sync {
    /// Final decision, after validation
    fn on_decision(&self, _ticker: &str, _decision: &Decision) {}

    /// The validator replaced the oracle's action
    fn on_override(&self, _ticker: &str, _original: &Decision, _result: &ValidationResult) {}

    /// An order went through
    fn on_trade(&self, _ticker: &str, _decision: &Decision, _trade_id: &str) {}
}

/// Callbacks that ignore everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl PipelineCallbacks for NoopCallbacks {}

/// Input to one pipeline run
#[derive(Clone)]
pub struct PipelineContext {
    pub ticker: String,
    pub trading_type: CycleKind,
    pub callbacks: Arc<dyn PipelineCallbacks>,
}

impl PipelineContext {
    pub fn new(ticker: impl Into<String>, trading_type: CycleKind) -> Self {
        Self {
            ticker: ticker.into(),
            trading_type,
            callbacks: Arc::new(NoopCallbacks),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn PipelineCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("ticker", &self.ticker)
            .field("trading_type", &self.trading_type)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Success,
    Failed,
    Skipped,
}

/// What a pipeline run reports back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub status: PipelineStatus,
    pub decision: Decision,
    pub trade_id: Option<String>,
    pub error: Option<String>,
}

impl PipelineOutput {
    pub fn success(decision: Decision, trade_id: Option<String>) -> Self {
        Self {
            status: PipelineStatus::Success,
            decision,
            trade_id,
            error: None,
        }
    }

    /// Nothing to do this tick; the run still counts as completed
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: PipelineStatus::Skipped,
            decision: Decision::hold(reason),
            trade_id: None,
            error: None,
        }
    }

    /// The run went wrong after producing `decision`
    pub fn failed(decision: Decision, error: impl Into<String>) -> Self {
        Self {
            status: PipelineStatus::Failed,
            decision,
            trade_id: None,
            error: Some(error.into()),
        }
    }
}

/// One full decision run for a ticker.
///
/// Errors returned here, panics and overruns are all turned into a failed
/// cycle by the caller; implementations need not catch anything.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn execute(&self, ctx: PipelineContext) -> Result<PipelineOutput>;
}

// ============================================================================
// Collaborators
// ============================================================================

/// Indicator snapshot plus optional cross-market context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub indicators: Indicators,
    #[serde(default)]
    pub conditions: Option<MarketConditions>,
    /// Raw payload forwarded to the oracle and kept on the decision
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

/// Candles and indicator math live behind this
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn snapshot(&self, ticker: &str, kind: CycleKind) -> Result<MarketSnapshot>;
}

/// The AI model that proposes an action
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, ticker: &str, kind: CycleKind, snapshot: &MarketSnapshot) -> Result<Decision>;
}

/// Places the order for an already-validated BUY or SELL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Returns the exchange trade id
    async fn execute(&self, ticker: &str, decision: &Decision) -> Result<String>;
}

// ============================================================================
// OraclePipeline
// ============================================================================

/// Market data → oracle → validator → exchange
pub struct OraclePipeline {
    market: Arc<dyn MarketDataSource>,
    oracle: Arc<dyn DecisionOracle>,
    executor: Arc<dyn OrderExecutor>,
    validator: DecisionValidator,
}

impl OraclePipeline {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        oracle: Arc<dyn DecisionOracle>,
        executor: Arc<dyn OrderExecutor>,
        validator: DecisionValidator,
    ) -> Self {
        Self {
            market,
            oracle,
            executor,
            validator,
        }
    }
}

#[async_trait]
impl Pipeline for OraclePipeline {
    async fn execute(&self, ctx: PipelineContext) -> Result<PipelineOutput> {
        let ticker = ctx.ticker.as_str();
        let snapshot = self.market.snapshot(ticker, ctx.trading_type).await?;

        // Data gaps fail the run; the candle stays retryable.
        if snapshot.indicators.is_empty() {
            warn!("No indicators for {}, nothing to decide on", ticker);
            let reason = format!("no indicators for {}", ticker);
            return Ok(PipelineOutput::failed(Decision::hold(reason.clone()), reason));
        }

        let mut proposed = self.oracle.decide(ticker, ctx.trading_type, &snapshot).await?;
        if proposed.market_data.is_none() {
            if let Some(raw) = &snapshot.raw {
                proposed = proposed.with_market_data(raw.clone());
            }
        }
        debug!(
            "Oracle proposed {} for {} ({} confidence)",
            proposed.action, ticker, proposed.confidence
        );

        let verdict = self
            .validator
            .validate(&proposed, &snapshot.indicators, snapshot.conditions.as_ref());
        let decision = self.validator.apply(&proposed, &verdict);

        if decision.is_overridden() {
            warn!(
                "Validator overrode {} -> {} for {} [{}]: {}",
                proposed.action,
                decision.action,
                ticker,
                verdict.rule.map(|r| r.to_string()).unwrap_or_default(),
                verdict.reason
            );
            ctx.callbacks.on_override(ticker, &proposed, &verdict);
        }
        info!("{}", generate_report(&verdict, &proposed, &snapshot.indicators));
        ctx.callbacks.on_decision(ticker, &decision);

        if !decision.action.is_trade() {
            return Ok(PipelineOutput::success(decision, None));
        }

        match self.executor.execute(ticker, &decision).await {
            Ok(trade_id) => {
                info!("Executed {} {} (trade {})", decision.action, ticker, trade_id);
                ctx.callbacks.on_trade(ticker, &decision, &trade_id);
                Ok(PipelineOutput::success(decision, Some(trade_id)))
            }
            Err(e) => {
                warn!("Order for {} failed: {}", ticker, e);
                Ok(PipelineOutput::failed(decision, e.to_string()))
            }
        }
    }
}

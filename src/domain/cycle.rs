use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Action, Decision};
use crate::coordination::LockName;
use crate::error::CycleErrorKind;

/// Which periodic job a cycle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// Full decision cycle: market data, oracle, validation, order
    Trading,
    /// Tighter loop over open positions
    PositionManagement,
}

impl CycleKind {
    pub fn lock_name(&self) -> LockName {
        match self {
            CycleKind::Trading => LockName::TradingCycle,
            CycleKind::PositionManagement => LockName::PositionManagement,
        }
    }

    /// Action component of the idempotency key
    pub fn action_tag(&self) -> &'static str {
        match self {
            CycleKind::Trading => "trading_cycle",
            CycleKind::PositionManagement => "position_management",
        }
    }
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.action_tag())
    }
}

/// Terminal outcome of one cycle invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Success,
    Skipped,
    Blocked,
    Failed,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStatus::Success => write!(f, "success"),
            CycleStatus::Skipped => write!(f, "skipped"),
            CycleStatus::Blocked => write!(f, "blocked"),
            CycleStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a caller gets back from the orchestrator. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_id: Uuid,
    pub kind: CycleKind,
    pub ticker: String,
    pub status: CycleStatus,
    pub decision: Action,
    /// Full decision when the pipeline produced one
    pub detail: Option<Decision>,
    pub idempotency_key: Option<String>,
    pub trade_id: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
    pub error_kind: Option<CycleErrorKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleResult {
    pub fn is_success(&self) -> bool {
        self.status == CycleStatus::Success
    }

    /// Whether this outcome should raise an operator alert
    pub fn should_alert(&self) -> bool {
        self.error_kind.is_some_and(|k| k.is_alertable())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CycleResultBuilder {
    cycle_id: Uuid,
    kind: CycleKind,
    ticker: String,
    started_at: DateTime<Utc>,
    idempotency_key: Option<String>,
}

impl CycleResultBuilder {
    pub(crate) fn new(kind: CycleKind, ticker: &str) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            kind,
            ticker: ticker.to_string(),
            started_at: Utc::now(),
            idempotency_key: None,
        }
    }

    pub(crate) fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    pub(crate) fn set_key(&mut self, key: String) {
        self.idempotency_key = Some(key);
    }

    fn finish(&self, status: CycleStatus, decision: Action) -> CycleResult {
        CycleResult {
            cycle_id: self.cycle_id,
            kind: self.kind,
            ticker: self.ticker.clone(),
            status,
            decision,
            detail: None,
            idempotency_key: self.idempotency_key.clone(),
            trade_id: None,
            error: None,
            reason: None,
            error_kind: None,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    pub(crate) fn success(&self, decision: Decision, trade_id: Option<String>) -> CycleResult {
        let overridden = decision.is_overridden();
        let mut result = self.finish(CycleStatus::Success, decision.action);
        result.reason = Some(decision.reason.clone());
        result.trade_id = trade_id;
        if overridden {
            result.error_kind = Some(CycleErrorKind::ValidationOverride);
        }
        result.detail = Some(decision);
        result
    }

    pub(crate) fn skipped(&self, reason: &str, kind: Option<CycleErrorKind>) -> CycleResult {
        let mut result = self.finish(CycleStatus::Skipped, Action::Hold);
        result.reason = Some(reason.to_string());
        result.error_kind = kind;
        result
    }

    pub(crate) fn blocked(&self, error: String, kind: CycleErrorKind) -> CycleResult {
        let mut result = self.finish(CycleStatus::Blocked, Action::Hold);
        result.error = Some(error);
        result.error_kind = Some(kind);
        result
    }

    pub(crate) fn failed(
        &self,
        reason: Option<&str>,
        error: Option<String>,
        kind: CycleErrorKind,
    ) -> CycleResult {
        let mut result = self.finish(CycleStatus::Failed, Action::Hold);
        result.reason = reason.map(str::to_string);
        result.error = error;
        result.error_kind = Some(kind);
        result
    }
}

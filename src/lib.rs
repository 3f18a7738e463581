pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod services;
pub mod strategy;
pub mod validation;

pub use config::AppConfig;
pub use coordination::{LockCoordinator, LockGuard, LockName};
pub use coordinator::CycleOrchestrator;
pub use domain::{
    Action, Confidence, CycleKind, CycleResult, CycleStatus, Decision, Indicators,
    MarketConditions, Timeframe,
};
pub use error::{CycleErrorKind, CycleGuardError, Result};
pub use services::{CycleMetrics, IdempotencySweeper};
pub use strategy::{
    IdempotencyGuard, IdempotencyKey, OraclePipeline, Pipeline, PipelineCallbacks,
    PipelineContext, PipelineOutput, PipelineStatus,
};
pub use validation::{DecisionValidator, ValidationResult};

//! Strategy module
//!
//! Exactly-once bookkeeping for candle/action pairs and the decision
//! pipeline the orchestrator drives.

pub mod idempotency;
pub mod pipeline;

pub use idempotency::{
    make_key, IdempotencyGuard, IdempotencyKey, IdempotencyStore, InMemoryIdempotencyStore,
    PgIdempotencyStore, DEFAULT_TTL_HOURS,
};
pub use pipeline::{
    DecisionOracle, MarketDataSource, MarketSnapshot, NoopCallbacks, OraclePipeline,
    OrderExecutor, Pipeline, PipelineCallbacks, PipelineContext, PipelineOutput, PipelineStatus,
};

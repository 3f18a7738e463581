//! Cycle orchestration
//!
//! Composes the cycle lock, the idempotency guard and a pluggable pipeline
//! into one call per scheduler tick that always returns a `CycleResult`.

pub mod orchestrator;

pub use orchestrator::CycleOrchestrator;

pub mod metrics;
pub mod sweeper;

pub use metrics::CycleMetrics;
pub use sweeper::IdempotencySweeper;

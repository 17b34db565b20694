//! CPU telemetry: utilization sampling and the aggregator stream.

mod collector;
mod reporter;

pub use collector::CpuUtilizationTracker;
pub use reporter::{MetricsReporter, ReporterConfig};

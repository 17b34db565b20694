//! Wire messages shared with the queue proxy.
//!
//! The schema is a single message, declared inline rather than generated.

/// Per-pod utilization report consumed by the queue proxy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PodMetrics {
    #[prost(double, tag = "1")]
    pub cpu_utilization: f64,
}

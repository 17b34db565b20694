//! Core data models for the execution sidecar

use serde::{Deserialize, Serialize};

/// Default CPU quota applied when a request carries no `cpu_quota` header,
/// in millicores.
pub const DEFAULT_CPU_QUOTA_MILLICORES: u64 = 500;

/// Default linear-memory cap applied when a request carries no
/// `Memory-Request` header, in megabytes.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 200;

/// Identity of the pod this sidecar runs in. Immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodIdentity {
    /// Pod UID as handed down by the orchestrator.
    pub pod_uid: String,
    /// Container id discovered by scanning the pod slice for the cgroup
    /// holding PID 1.
    pub container_id: String,
}

/// Resource limits for a single execution request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_quota_millicores: u64,
    pub memory_limit_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_quota_millicores: DEFAULT_CPU_QUOTA_MILLICORES,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
        }
    }
}

/// One module execution request, as handed to the pipeline.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Module filename, relative to the module store.
    pub wasm_file: String,
    /// Payload delivered to the module as stdin. Empty for GET requests.
    pub parameter: String,
    pub limits: ResourceLimits,
}

/// Wall-clock durations of the pipeline sub-phases, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PhaseTimings {
    pub cgroup_create_ms: u128,
    pub cgroup_assign_ms: u128,
    pub execution_ms: u128,
}

/// Successful outcome of one execution request.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub request_id: String,
    /// Raw module stdout. Trailing NULs are trimmed at the HTTP boundary.
    pub output: String,
    pub timings: PhaseTimings,
    /// Number of requests in flight at the time this one was admitted.
    pub in_flight: i64,
}

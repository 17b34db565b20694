//! Sidecar library for per-request WASM execution
//!
//! This crate provides the core functionality for:
//! - cgroup-v2 threaded-subtree isolation, one cgroup per request
//! - WASM module execution under WASI with linear-memory caps
//! - The request pipeline binding the two on a dedicated OS thread
//! - Readiness / admission control from memory-utilization windows
//! - CPU telemetry streaming to the queue proxy

pub mod cgroup;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod proto;
pub mod readiness;
pub mod wasm;

pub use cgroup::{CgroupManager, CgroupPaths};
pub use executor::{ExecuteError, RequestExecutor};
pub use models::*;
pub use observability::{SidecarMetrics, StructuredLogger};
pub use readiness::{ReadinessConfig, ReadinessController, ReadinessResponse};

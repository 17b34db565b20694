//! Sidecar configuration
//!
//! All settings come from the environment; a missing required value fails
//! startup.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SidecarConfig {
    /// Pod UID from the downward API.
    pub pod_uid: String,

    /// `debug` enables verbose logging.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Data plane
    pub webserver_host: String,
    pub webserver_port: u16,
    /// `wasmtime` or `wasmedge`; anything else falls back to wasmtime.
    pub wasm_runtime: String,

    // Readiness / admission
    pub readiness_window: usize,
    pub readiness_utilization_treshold: f64,
    pub readiness_rand_treshold: u32,
    pub gc_utilization_treshold: f64,
    /// Container memory limit in MB.
    pub memory_limit: f64,

    // Healthcheck plane
    pub healthcheck_host: String,
    pub healthcheck_port: u16,

    // Telemetry
    pub reporting_period_ms: u64,
    pub qp_host: String,
    pub qp_port: u16,
    pub max_retries: u32,
    pub retry_delay_sec: u64,
    pub metrics_collection_window: usize,

    /// Reject requests without resource headers instead of applying the
    /// default limits.
    #[serde(default)]
    pub strict_request_validation: bool,

    /// Fraction of the memory limit the WasmEdge backend pre-touches before
    /// the entry point runs.
    #[serde(default = "default_pre_allocation_ratio")]
    pub mem_pre_allocation_ratio: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pre_allocation_ratio() -> f64 {
    0.5
}

impl SidecarConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to read environment")?;

        config
            .try_deserialize()
            .context("missing or invalid configuration")
    }
}

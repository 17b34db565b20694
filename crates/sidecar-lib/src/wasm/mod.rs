//! WASM module execution
//!
//! The engine is abstracted behind [`WasmRunner`] so the pipeline does not
//! care which backend runs a module. The backend is selected by the
//! `WASM_RUNTIME` configuration string; any unrecognized value falls back to
//! wasmtime.

#[cfg(feature = "wasmedge")]
mod wasmedge;
mod wasmtime;

#[cfg(feature = "wasmedge")]
pub use self::wasmedge::WasmEdgeRunner;
pub use self::wasmtime::WasmtimeRunner;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Conventional WASI entry point.
pub const ENTRY_POINT: &str = "_start";

/// Fixed module store, relative to the working directory.
pub const DEFAULT_MODULES_DIR: &str = "functions";

const WASM_PAGE_SIZE: u64 = 65_536;
const BYTES_PER_MB: u64 = 1_048_576;

/// Megabytes to bytes.
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb * BYTES_PER_MB
}

/// Megabytes to 64 KiB WASM pages, rounding up.
pub fn mb_to_wasm_pages(mb: u64) -> u64 {
    mb_to_bytes(mb).div_ceil(WASM_PAGE_SIZE)
}

/// Failure modes of one module execution.
#[derive(Debug, Error)]
pub enum WasmError {
    /// The module artifact is missing, malformed, or failed validation.
    #[error("failed to load module `{module}`: {reason}")]
    Load { module: String, reason: String },
    /// The module loaded but could not run to completion.
    #[error("module `{module}` failed during execution: {reason}")]
    Runtime { module: String, reason: String },
    /// Scratch file handling around the execution failed.
    #[error("scratch I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One pluggable execution engine.
///
/// `run` is synchronous on purpose: it executes on the request's dedicated
/// OS thread, so the cgroup CPU quota binds the thread doing the work.
pub trait WasmRunner: Send + Sync {
    fn run(
        &self,
        request_id: &str,
        wasm_file: &str,
        parameter: &str,
        memory_limit_mb: u64,
    ) -> Result<String, WasmError>;

    /// Engine name, for logs and metrics labels.
    fn name(&self) -> &'static str;
}

/// Runner selection and tuning.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub runtime: String,
    pub modules_dir: PathBuf,
    /// Fraction of the memory limit the WasmEdge backend pre-touches before
    /// the entry point runs.
    pub mem_pre_allocation_ratio: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runtime: "wasmtime".to_string(),
            modules_dir: PathBuf::from(DEFAULT_MODULES_DIR),
            mem_pre_allocation_ratio: 0.5,
        }
    }
}

/// Create the runner named by the configuration, falling back to wasmtime.
pub fn create_runner(config: &RunnerConfig) -> Arc<dyn WasmRunner> {
    match config.runtime.as_str() {
        "wasmtime" => Arc::new(WasmtimeRunner::new(&config.modules_dir)),
        #[cfg(feature = "wasmedge")]
        "wasmedge" => Arc::new(WasmEdgeRunner::new(
            &config.modules_dir,
            config.mem_pre_allocation_ratio,
        )),
        #[cfg(not(feature = "wasmedge"))]
        "wasmedge" => {
            tracing::warn!("wasmedge support not compiled in, using wasmtime");
            Arc::new(WasmtimeRunner::new(&config.modules_dir))
        }
        other => {
            tracing::warn!(runtime = other, "unknown WASM runtime, using wasmtime");
            Arc::new(WasmtimeRunner::new(&config.modules_dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_conversions() {
        assert_eq!(mb_to_bytes(200), 209_715_200);
        assert_eq!(mb_to_wasm_pages(200), 3_200);
        assert_eq!(mb_to_wasm_pages(0), 0);
        assert_eq!(mb_to_wasm_pages(1), 16);
    }

    #[test]
    fn unknown_runtime_falls_back_to_wasmtime() {
        let config = RunnerConfig {
            runtime: "not-a-runtime".to_string(),
            ..RunnerConfig::default()
        };
        assert_eq!(create_runner(&config).name(), "wasmtime");
    }

    #[test]
    fn default_config_selects_wasmtime() {
        assert_eq!(create_runner(&RunnerConfig::default()).name(), "wasmtime");
    }
}

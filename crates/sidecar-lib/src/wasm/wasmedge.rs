//! WasmEdge execution backend
//!
//! Drives a WasmEdge VM with a max-memory-page cap and the bindgen `_main`
//! entry convention: input and output travel through the module's exported
//! linear memory and its `allocate`/`deallocate` helpers rather than stdio.
//! A slice of the memory limit is pre-touched before the entry point runs to
//! warm pages for cold starts.

use super::{mb_to_bytes, mb_to_wasm_pages, WasmError, WasmRunner};
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;
use wasmedge_sdk::config::{
    CommonConfigOptions, ConfigBuilder, HostRegistrationConfigOptions, RuntimeConfigOptions,
};
use wasmedge_sdk::{params, VmBuilder, WasmValue};

const MODULE_NAME: &str = "main";
const BIND_ENTRY: &str = "_main";
const SCAN_CHUNK: u32 = 4096;

pub struct WasmEdgeRunner {
    modules_dir: PathBuf,
    pre_alloc_ratio: f64,
}

impl WasmEdgeRunner {
    pub fn new(modules_dir: impl Into<PathBuf>, pre_alloc_ratio: f64) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            pre_alloc_ratio,
        }
    }
}

impl WasmRunner for WasmEdgeRunner {
    fn run(
        &self,
        _request_id: &str,
        wasm_file: &str,
        _parameter: &str,
        memory_limit_mb: u64,
    ) -> Result<String, WasmError> {
        let runtime_err = |reason: String| WasmError::Runtime {
            module: wasm_file.to_string(),
            reason,
        };

        let config = ConfigBuilder::new(CommonConfigOptions::default())
            .with_host_registration_config(HostRegistrationConfigOptions::default().wasi(true))
            .with_runtime_config(
                RuntimeConfigOptions::default()
                    .max_memory_pages(mb_to_wasm_pages(memory_limit_mb) as u32),
            )
            .build()
            .map_err(|e| runtime_err(format!("engine configuration failed: {e}")))?;
        debug!(
            max_memory_pages = mb_to_wasm_pages(memory_limit_mb),
            "memory is configured"
        );

        let mut vm = VmBuilder::new()
            .with_config(config)
            .build()
            .map_err(|e| runtime_err(format!("vm construction failed: {e}")))?;
        if let Some(wasi) = vm.wasi_module_mut() {
            wasi.initialize(None, None, None);
        }

        let vm = vm
            .register_module_from_file(MODULE_NAME, self.modules_dir.join(wasm_file))
            .map_err(|e| WasmError::Load {
                module: wasm_file.to_string(),
                reason: e.to_string(),
            })?;

        // Pre-touch pre_alloc_ratio of the limit through the module allocator
        // before the entry point runs.
        let prealloc_mb = (memory_limit_mb as f64 * self.pre_alloc_ratio) as u64;
        let prealloc_bytes = mb_to_bytes(prealloc_mb) as i32 + 1;
        let warm_start = Instant::now();
        let returns = vm
            .run_func(Some(MODULE_NAME), "allocate", params!(prealloc_bytes))
            .map_err(|e| runtime_err(format!("allocate failed: {e}")))?;
        let input_ptr = returns.first().map(WasmValue::to_i32).unwrap_or_default();

        {
            let module = vm
                .named_module(MODULE_NAME)
                .map_err(|e| runtime_err(e.to_string()))?;
            let mut memory = module
                .memory("memory")
                .ok_or_else(|| runtime_err("module exports no memory".to_string()))?;
            let mut warmed = vec![1u8; (prealloc_bytes - 1) as usize];
            warmed.push(0);
            memory
                .write(warmed, input_ptr as u32)
                .map_err(|e| runtime_err(format!("pre-allocation write failed: {e}")))?;
        }
        debug!(prealloc_mb, elapsed = ?warm_start.elapsed(), "memory is pre-allocated");

        vm.run_func(
            Some(MODULE_NAME),
            "deallocate",
            params!(input_ptr, prealloc_bytes),
        )
        .map_err(|e| runtime_err(format!("deallocate failed: {e}")))?;

        let warmed_ms = warm_start.elapsed().as_millis() as i32;
        let returns = vm
            .run_func(
                Some(MODULE_NAME),
                BIND_ENTRY,
                params!(input_ptr, prealloc_mb as i32, warmed_ms),
            )
            .map_err(|e| runtime_err(e.to_string()))?;
        let output_ptr = returns.first().map(WasmValue::to_i32).unwrap_or_default();

        // Output is NUL-terminated in the exported memory.
        let output = {
            let module = vm
                .named_module(MODULE_NAME)
                .map_err(|e| runtime_err(e.to_string()))?;
            let memory = module
                .memory("memory")
                .ok_or_else(|| runtime_err("module exports no memory".to_string()))?;
            let mut collected = Vec::new();
            let mut offset = output_ptr as u32;
            'scan: loop {
                let chunk = memory
                    .read(offset, SCAN_CHUNK)
                    .map_err(|e| runtime_err(format!("output read failed: {e}")))?;
                for byte in chunk {
                    if byte == 0 {
                        break 'scan;
                    }
                    collected.push(byte);
                }
                offset += SCAN_CHUNK;
            }
            collected
        };

        let output_len = output.len() as i32;
        vm.run_func(
            Some(MODULE_NAME),
            "deallocate",
            params!(output_ptr, output_len + 1),
        )
        .map_err(|e| runtime_err(format!("deallocate failed: {e}")))?;

        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    fn name(&self) -> &'static str {
        "wasmedge"
    }
}

//! wasmtime execution backend
//!
//! Runs engine-serialized modules with a WASI preview1 environment whose
//! stdin and stdout are bound to per-request scratch files, under a
//! store-level linear-memory cap.

use super::{mb_to_bytes, WasmError, WasmRunner, ENTRY_POINT};
use std::fs::File;
use std::path::PathBuf;
use tracing::debug;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasi_common::WasiCtx;
use wasmtime::{Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder};

/// Store state: the WASI context plus the memory limiter.
struct StoreState {
    wasi: WasiCtx,
    limits: StoreLimits,
}

pub struct WasmtimeRunner {
    modules_dir: PathBuf,
}

impl WasmtimeRunner {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
        }
    }
}

impl WasmRunner for WasmtimeRunner {
    fn run(
        &self,
        request_id: &str,
        wasm_file: &str,
        parameter: &str,
        memory_limit_mb: u64,
    ) -> Result<String, WasmError> {
        let runtime_err = |reason: String| WasmError::Runtime {
            module: wasm_file.to_string(),
            reason,
        };

        // Scratch files are removed on every exit path by the TempDir guard.
        let scratch = tempfile::Builder::new().prefix("wasm-out").tempdir()?;
        let stdin_path = scratch.path().join(format!("{request_id}-stdin"));
        let stdout_path = scratch.path().join(request_id);
        std::fs::write(&stdin_path, parameter)?;
        let stdin = File::open(&stdin_path)?;
        let stdout = File::create(&stdout_path)?;

        let engine = Engine::default();
        let module_path = self.modules_dir.join(wasm_file);
        // The module store only holds artifacts serialized by this same
        // engine configuration.
        let module = unsafe { Module::deserialize_file(&engine, &module_path) }.map_err(|e| {
            WasmError::Load {
                module: wasm_file.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!(module = wasm_file, memory_limit_mb, "created module");

        let mut linker: Linker<StoreState> = Linker::new(&engine);
        wasi_common::sync::add_to_linker(&mut linker, |state: &mut StoreState| &mut state.wasi)
            .map_err(|e| runtime_err(e.to_string()))?;

        let wasi = wasi_common::sync::WasiCtxBuilder::new()
            .stdin(Box::new(ReadPipe::new(stdin)))
            .stdout(Box::new(WritePipe::new(stdout)))
            .build();
        let limits = StoreLimitsBuilder::new()
            .memory_size(mb_to_bytes(memory_limit_mb) as usize)
            .memories(1)
            .instances(1)
            .build();
        let mut store = Store::new(&engine, StoreState { wasi, limits });
        store.limiter(|state| &mut state.limits);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| runtime_err(e.to_string()))?;
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, ENTRY_POINT)
            .map_err(|e| runtime_err(format!("no `{ENTRY_POINT}` export: {e}")))?;
        entry
            .call(&mut store, ())
            .map_err(|e| runtime_err(e.to_string()))?;
        drop(store);

        let output = std::fs::read(&stdout_path)?;
        debug!(module = wasm_file, bytes = output.len(), "executed WASM function");
        Ok(format!("{}\n", String::from_utf8_lossy(&output)))
    }

    fn name(&self) -> &'static str {
        "wasmtime"
    }
}

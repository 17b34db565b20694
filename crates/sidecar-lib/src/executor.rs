//! Per-request execution pipeline
//!
//! Each admitted request is handed to a dedicated OS thread for its whole
//! lifetime. The cgroup quota binds a kernel TID, so the thread that joins
//! the request cgroup must be the thread that runs the module; spawning a
//! fresh native thread per request guarantees that, independent of how the
//! async runtime schedules the handler.

use crate::cgroup::CgroupManager;
use crate::models::{PhaseTimings, RunOutcome, RunRequest};
use crate::wasm::{WasmError, WasmRunner};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Wasm(#[from] WasmError),
    #[error("worker thread exited before reporting a result")]
    WorkerLost,
}

/// Drives the Acquire → Assign → Run → Release sequence for every request.
pub struct RequestExecutor {
    cgroups: Arc<CgroupManager>,
    runner: Arc<dyn WasmRunner>,
    in_flight: AtomicI64,
}

impl RequestExecutor {
    pub fn new(cgroups: Arc<CgroupManager>, runner: Arc<dyn WasmRunner>) -> Self {
        Self {
            cgroups,
            runner,
            in_flight: AtomicI64::new(0),
        }
    }

    /// Requests currently executing.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one request to completion on a dedicated OS thread.
    pub async fn execute(&self, request: RunRequest) -> Result<RunOutcome, ExecuteError> {
        // The guard keeps the counter honest even if this future is dropped
        // while the worker is still running.
        let guard = InFlightGuard::enter(&self.in_flight);
        let in_flight = guard.count;

        let (tx, rx) = oneshot::channel();
        let cgroups = Arc::clone(&self.cgroups);
        let runner = Arc::clone(&self.runner);
        let spawned = std::thread::Builder::new()
            .name("wasm-exec".to_string())
            .spawn(move || {
                let _ = tx.send(run_pinned(&cgroups, runner.as_ref(), &request, in_flight));
            });
        if let Err(e) = spawned {
            error!(reason = %e, "failed to spawn worker thread");
            return Err(ExecuteError::WorkerLost);
        }
        rx.await.map_err(|_| ExecuteError::WorkerLost)?
    }
}

/// Body of the dedicated worker thread. The sub-phases run strictly in
/// order on this one thread; the guard releases the cgroup on every exit
/// path, including panics in the runner.
fn run_pinned(
    cgroups: &CgroupManager,
    runner: &dyn WasmRunner,
    request: &RunRequest,
    in_flight: i64,
) -> Result<RunOutcome, ExecuteError> {
    let start = Instant::now();
    let tid = unsafe { libc::gettid() };
    let request_id = Uuid::new_v4().to_string();
    debug!(tid, request_id = %request_id, wasm_file = %request.wasm_file, "pinned request to worker thread");

    let create_start = Instant::now();
    let cgroup = cgroups.acquire(
        &request_id,
        request.limits.cpu_quota_millicores,
        request.limits.memory_limit_mb,
    );
    let cgroup_create_ms = create_start.elapsed().as_millis();

    let assign_start = Instant::now();
    cgroups.assign(&request_id, tid);
    let cgroup_assign_ms = assign_start.elapsed().as_millis();

    let exec_start = Instant::now();
    let result = runner.run(
        &request_id,
        &request.wasm_file,
        &request.parameter,
        request.limits.memory_limit_mb,
    );
    let execution_ms = exec_start.elapsed().as_millis();

    drop(cgroup);

    info!(request_id = %request_id, tid, elapsed = ?start.elapsed(), "done with a request");
    let output = result?;
    Ok(RunOutcome {
        request_id,
        output,
        timings: PhaseTimings {
            cgroup_create_ms,
            cgroup_assign_ms,
            execution_ms,
        },
        in_flight,
    })
}

struct InFlightGuard<'a> {
    counter: &'a AtomicI64,
    count: i64,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicI64) -> Self {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, count }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupPaths;
    use crate::models::ResourceLimits;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct EchoRunner;

    impl WasmRunner for EchoRunner {
        fn run(&self, _: &str, _: &str, parameter: &str, _: u64) -> Result<String, WasmError> {
            Ok(format!("{parameter}\n"))
        }

        fn name(&self) -> &'static str {
            "echo"
        }
    }

    struct SleepRunner(Duration);

    impl WasmRunner for SleepRunner {
        fn run(&self, _: &str, _: &str, _: &str, _: u64) -> Result<String, WasmError> {
            std::thread::sleep(self.0);
            Ok("done\n".to_string())
        }

        fn name(&self) -> &'static str {
            "sleep"
        }
    }

    struct FailingRunner;

    impl WasmRunner for FailingRunner {
        fn run(&self, _: &str, wasm_file: &str, _: &str, _: u64) -> Result<String, WasmError> {
            Err(WasmError::Load {
                module: wasm_file.to_string(),
                reason: "nope".to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn fake_tree() -> (TempDir, Arc<CgroupManager>) {
        let root = TempDir::new().unwrap();
        let paths = CgroupPaths::new(root.path(), "aa-bb", "cri-containerd-0");
        let container = paths.container_dir();
        fs::create_dir_all(&container).unwrap();
        fs::write(container.join("cgroup.threads"), "").unwrap();
        (root, Arc::new(CgroupManager::new(paths)))
    }

    fn request(parameter: &str) -> RunRequest {
        RunRequest {
            wasm_file: "echo.wasm".to_string(),
            parameter: parameter.to_string(),
            limits: ResourceLimits::default(),
        }
    }

    fn leftover_request_dirs(manager: &CgroupManager) -> usize {
        fs::read_dir(manager.container_dir())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count()
    }

    #[tokio::test]
    async fn executes_and_cleans_up() {
        let (_root, cgroups) = fake_tree();
        let executor = Arc::new(RequestExecutor::new(cgroups.clone(), Arc::new(EchoRunner)));

        let outcome = executor.execute(request("hi")).await.unwrap();
        assert_eq!(outcome.output, "hi\n");
        assert_eq!(outcome.in_flight, 1);
        assert!(!outcome.request_id.is_empty());

        assert_eq!(executor.in_flight(), 0);
        assert_eq!(leftover_request_dirs(&cgroups), 0);
    }

    #[tokio::test]
    async fn worker_thread_is_charged_to_the_request_cgroup() {
        let (_root, cgroups) = fake_tree();
        let executor = Arc::new(RequestExecutor::new(cgroups.clone(), Arc::new(EchoRunner)));

        executor.execute(request("x")).await.unwrap();

        // After release the worker TID has been migrated back out.
        let container_threads =
            fs::read_to_string(cgroups.container_dir().join("cgroup.threads")).unwrap();
        assert_eq!(container_threads.trim().lines().count(), 1);
        let tid: i64 = container_threads.trim().parse().unwrap();
        assert!(tid > 0);
    }

    #[tokio::test]
    async fn runner_failure_still_releases_the_cgroup() {
        let (_root, cgroups) = fake_tree();
        let executor = Arc::new(RequestExecutor::new(cgroups.clone(), Arc::new(FailingRunner)));

        let err = executor.execute(request("")).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Wasm(WasmError::Load { .. })));
        assert_eq!(executor.in_flight(), 0);
        assert_eq!(leftover_request_dirs(&cgroups), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_are_isolated_and_fully_released() {
        let (_root, cgroups) = fake_tree();
        let executor = Arc::new(RequestExecutor::new(
            cgroups.clone(),
            Arc::new(SleepRunner(Duration::from_millis(30))),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                executor.execute(request("")).await
            }));
        }

        let mut request_ids = std::collections::HashSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.output, "done\n");
            assert!(request_ids.insert(outcome.request_id));
        }

        assert_eq!(request_ids.len(), 16);
        assert_eq!(executor.in_flight(), 0);
        assert_eq!(leftover_request_dirs(&cgroups), 0);
    }
}

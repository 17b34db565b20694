//! Per-request threaded cgroup management
//!
//! One threaded child cgroup is created under the container cgroup for each
//! request. The request's worker thread is moved in for the duration of the
//! module execution and migrated back out before the cgroup is removed.
//!
//! Pseudo-file I/O on the request path is synchronous: it runs on the
//! request's dedicated OS thread. Counter reads for probes and telemetry are
//! async. Failures are logged and never abort the process.

use super::CgroupPaths;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, error};

/// Microseconds per CFS period in `cpu.max`.
const CPU_PERIOD_US: u64 = 100_000;

/// Manages the container's cgroup-v2 subtree.
pub struct CgroupManager {
    paths: CgroupPaths,
}

impl CgroupManager {
    pub fn new(paths: CgroupPaths) -> Self {
        Self { paths }
    }

    /// The container cgroup directory this manager operates under.
    pub fn container_dir(&self) -> PathBuf {
        self.paths.container_dir()
    }

    /// Enable the `cpu` controller for child cgroups of the container.
    pub fn init(&self) {
        let start = Instant::now();
        let path = self.paths.container_dir().join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&path, "+cpu") {
            error!(path = %path.display(), reason = %e, "failed to enable cpu controller");
        }
        debug!(path = %path.display(), elapsed = ?start.elapsed(), "added cpu to subtree_control");
    }

    /// Create and configure the threaded cgroup for one request. The memory
    /// limit is accepted here but enforced by the WASM runner's linear-memory
    /// cap, not by the cgroup.
    ///
    /// The returned guard migrates threads back and removes the cgroup when
    /// dropped, so every exit path releases.
    pub fn acquire(
        &self,
        name: &str,
        cpu_quota_millicores: u64,
        _memory_limit_mb: u64,
    ) -> CgroupGuard<'_> {
        self.create(name);
        self.mark_threaded(name);
        self.set_cpu_limit(name, cpu_quota_millicores);
        CgroupGuard {
            manager: self,
            name: name.to_string(),
        }
    }

    fn create(&self, name: &str) {
        let start = Instant::now();
        let dir = self.paths.request_dir(name);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!(name, reason = %e, "failed to create cgroup");
        }
        debug!(path = %dir.display(), elapsed = ?start.elapsed(), "created the cgroup");
    }

    fn mark_threaded(&self, name: &str) {
        let start = Instant::now();
        let path = self.paths.request_dir(name).join("cgroup.type");
        if let Err(e) = std::fs::write(&path, "threaded") {
            error!(path = %path.display(), reason = %e, "failed to change cgroup to threaded");
        }
        debug!(path = %path.display(), elapsed = ?start.elapsed(), "changed cgroup to threaded");
    }

    fn set_cpu_limit(&self, name: &str, millicores: u64) {
        let start = Instant::now();
        let path = self.paths.request_dir(name).join("cpu.max");
        // millicores * 100 = quota in microseconds per 100 ms period
        let text = format!("{} {}", millicores * 100, CPU_PERIOD_US);
        if let Err(e) = std::fs::write(&path, text) {
            error!(path = %path.display(), reason = %e, "failed to write cpu.max");
        }
        debug!(path = %path.display(), cpu_limit = millicores, elapsed = ?start.elapsed(), "applied resource limits");
    }

    /// Charge `tid` to the request's cgroup. The caller owns that thread and
    /// stays on it until the guard is dropped.
    pub fn assign(&self, name: &str, tid: i32) {
        let start = Instant::now();
        let path = self.paths.request_dir(name).join("cgroup.threads");
        match OpenOptions::new().append(true).create(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{tid}") {
                    error!(tid, reason = %e, "failed to write TID to threads file");
                }
            }
            Err(e) => {
                error!(path = %path.display(), reason = %e, "failed to open threads file");
            }
        }
        debug!(path = %path.display(), tid, elapsed = ?start.elapsed(), "assigned the cgroup");
    }

    /// Migrate every thread back to the container cgroup, then remove the
    /// request cgroup. Removal is skipped if a thread could not be migrated;
    /// a thread may never be stranded in a directory about to disappear.
    fn release(&self, name: &str) {
        let start = Instant::now();
        let threads_path = self.paths.request_dir(name).join("cgroup.threads");
        let container_threads_path = self.paths.container_dir().join("cgroup.threads");

        let threads = match std::fs::read_to_string(&threads_path) {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %threads_path.display(), reason = %e, "failed to open thread cgroup");
                return;
            }
        };

        let mut container_file = match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&container_threads_path)
        {
            Ok(file) => file,
            Err(e) => {
                error!(path = %container_threads_path.display(), reason = %e, "failed to open container cgroup");
                return;
            }
        };

        for tid in threads.lines().filter(|line| !line.trim().is_empty()) {
            if let Err(e) = writeln!(container_file, "{tid}") {
                error!(tid, reason = %e, "failed to migrate thread back to container cgroup");
                return;
            }
        }

        let dir = self.paths.request_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(path = %dir.display(), elapsed = ?start.elapsed(), "released the cgroup");
            }
            Err(e) => {
                error!(reason = %e, elapsed = ?start.elapsed(), "failed to delete the cgroup");
            }
        }
    }

    /// Cumulative CPU time of the container cgroup in microseconds, from the
    /// first line of `cpu.stat`.
    pub async fn cpu_usage_usec(&self) -> u64 {
        let path = self.paths.container_dir().join("cpu.stat");
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %path.display(), reason = %e, "failed to read cpu.stat");
                return 0;
            }
        };
        match parse_cpu_stat(&contents) {
            Some(usage) => usage,
            None => {
                error!(path = %path.display(), "unexpected format in cpu.stat");
                0
            }
        }
    }

    /// Physical plus swap memory of the container cgroup in megabytes.
    pub async fn memory_usage_mb(&self) -> f64 {
        self.read_memory_mb("memory.current").await + self.read_memory_mb("memory.swap.current").await
    }

    async fn read_memory_mb(&self, file: &str) -> f64 {
        let path = self.paths.container_dir().join(file);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %path.display(), reason = %e, "failed to open memory counter");
                return 0.0;
            }
        };
        match contents.trim().parse::<u64>() {
            Ok(bytes) => bytes as f64 / (1024.0 * 1024.0),
            Err(e) => {
                error!(path = %path.display(), reason = %e, "failed to parse memory counter");
                0.0
            }
        }
    }
}

/// Parse the first `key value` line of `cpu.stat` (`usage_usec`).
fn parse_cpu_stat(contents: &str) -> Option<u64> {
    let mut parts = contents.lines().next()?.split_whitespace();
    let _key = parts.next()?;
    parts.next()?.parse().ok()
}

/// Scoped ownership of a request cgroup. Dropping it migrates threads back
/// to the container cgroup and removes the directory.
pub struct CgroupGuard<'a> {
    manager: &'a CgroupManager,
    name: String,
}

impl Drop for CgroupGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.name);
    }
}

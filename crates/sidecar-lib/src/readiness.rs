//! Readiness / admission control
//!
//! Keeps a sliding window of container memory-utilization samples and sheds
//! traffic probabilistically while the window average sits above the
//! configured threshold.

use crate::cgroup::CgroupManager;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub const NOT_READY_REASON: &str = "memory utilization exceeded threshold";

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Container memory limit in MB, the denominator of every sample.
    pub memory_limit_mb: f64,
    /// Maximum number of samples kept.
    pub window: usize,
    pub utilization_threshold: f64,
    /// Parsed for compatibility with existing deployments; the shed roll
    /// currently compares against `utilization_threshold`.
    pub rand_threshold: u32,
    pub gc_utilization_threshold: f64,
}

/// JSON body of the readiness endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessResponse {
    fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    fn not_ready(reason: &str) -> Self {
        Self {
            ready: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Admission controller backing the readiness endpoint.
///
/// State is in-memory only; a restart begins with an empty window and
/// reports ready.
pub struct ReadinessController {
    cgroups: Arc<CgroupManager>,
    config: ReadinessConfig,
    window: Mutex<VecDeque<f64>>,
    rng: Mutex<StdRng>,
}

impl ReadinessController {
    pub fn new(cgroups: Arc<CgroupManager>, config: ReadinessConfig) -> Self {
        Self::with_rng(cgroups, config, StdRng::from_entropy())
    }

    /// Deterministic variant for tests.
    pub fn with_rng(cgroups: Arc<CgroupManager>, config: ReadinessConfig, rng: StdRng) -> Self {
        let window = VecDeque::with_capacity(config.window);
        Self {
            cgroups,
            config,
            window: Mutex::new(window),
            rng: Mutex::new(rng),
        }
    }

    /// One probe: sample, slide the window, maybe trim the allocator, decide.
    pub async fn check(&self) -> ReadinessResponse {
        let usage_mb = self.cgroups.memory_usage_mb().await;
        let utilization = usage_mb / self.config.memory_limit_mb;

        if utilization > self.config.gc_utilization_threshold {
            trim_allocator();
            debug!(usage_mb, utilization, "trimmed allocator under memory pressure");
        }

        let average = {
            let mut window = self.window.lock().await;
            window.push_back(utilization);
            if window.len() > self.config.window {
                window.pop_front();
            }
            window.iter().sum::<f64>() / window.len() as f64
        };

        let roll = self.rng.lock().await.gen_range(0..100u32);
        if should_shed(average, roll, self.config.utilization_threshold) {
            ReadinessResponse::not_ready(NOT_READY_REASON)
        } else {
            ReadinessResponse::ready()
        }
    }
}

/// The utilization threshold doubles as a percentage: windows above it still
/// admit roughly `threshold` out of every 100 probes.
fn should_shed(average: f64, roll: u32, threshold: f64) -> bool {
    average > threshold && f64::from(roll) > threshold
}

/// Best-effort return of freed heap pages to the kernel.
fn trim_allocator() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupPaths;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Fake container cgroup whose memory.current can be rewritten per probe.
    fn fake_tree(memory_bytes: u64) -> (TempDir, Arc<CgroupManager>, PathBuf) {
        let root = TempDir::new().unwrap();
        let paths = CgroupPaths::new(root.path(), "aa-bb", "cri-containerd-0");
        let container = paths.container_dir();
        fs::create_dir_all(&container).unwrap();
        let current = container.join("memory.current");
        fs::write(&current, memory_bytes.to_string()).unwrap();
        fs::write(container.join("memory.swap.current"), "0").unwrap();
        (root, Arc::new(CgroupManager::new(paths)), current)
    }

    fn config(window: usize, threshold: f64) -> ReadinessConfig {
        ReadinessConfig {
            memory_limit_mb: 100.0,
            window,
            utilization_threshold: threshold,
            rand_threshold: 90,
            gc_utilization_threshold: 10.0,
        }
    }

    #[tokio::test]
    async fn first_probe_on_an_idle_container_is_ready() {
        let (_root, cgroups, _) = fake_tree(1024 * 1024);
        let controller = ReadinessController::new(cgroups, config(5, 0.7));

        let response = controller.check().await;
        assert!(response.ready);
        assert!(response.reason.is_none());
    }

    #[tokio::test]
    async fn window_never_exceeds_the_configured_length() {
        let (_root, cgroups, _) = fake_tree(1024 * 1024);
        let controller = ReadinessController::new(cgroups, config(3, 0.7));

        for _ in 0..7 {
            controller.check().await;
        }
        assert_eq!(controller.window.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn window_average_is_a_true_mean() {
        let (_root, cgroups, current) = fake_tree(0);
        // Thresholds high enough that the probe never sheds.
        let controller = ReadinessController::new(cgroups, config(5, 100.0));

        // 10 MB, 20 MB, 30 MB against a 100 MB limit.
        for mb in [10u64, 20, 30] {
            fs::write(&current, (mb * 1024 * 1024).to_string()).unwrap();
            controller.check().await;
        }

        let window = controller.window.lock().await;
        let average = window.iter().sum::<f64>() / window.len() as f64;
        assert!((average - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sheds_when_saturated() {
        // 900 MB against a 100 MB limit: utilization 9.0.
        let (_root, cgroups, _) = fake_tree(900 * 1024 * 1024);
        let controller = ReadinessController::with_rng(
            cgroups,
            config(5, 0.7),
            StdRng::seed_from_u64(7),
        );

        let mut shed = 0;
        for _ in 0..50 {
            let response = controller.check().await;
            if !response.ready {
                assert_eq!(response.reason.as_deref(), Some(NOT_READY_REASON));
                shed += 1;
            }
        }
        // With the threshold at 0.7 the roll passes only on 0.
        assert!(shed >= 45);
    }

    #[test]
    fn shed_decision_uses_the_threshold_for_both_operands() {
        // Fractional threshold: any roll above 0.7 sheds a hot window.
        assert!(should_shed(0.9, 99, 0.7));
        assert!(should_shed(0.9, 1, 0.7));
        assert!(!should_shed(0.9, 0, 0.7));
        // Cool window never sheds.
        assert!(!should_shed(0.5, 99, 0.7));
        // Percentage-scale threshold: the ratio side can no longer trip.
        assert!(!should_shed(0.9, 99, 70.0));
        assert!(should_shed(71.0, 99, 70.0));
        assert!(!should_shed(71.0, 50, 70.0));
    }
}

//! Sliding-window CPU utilization sampling

use crate::cgroup::CgroupManager;
use std::collections::VecDeque;
use std::sync::Arc;

/// Derives instantaneous CPU utilization from the container's cumulative
/// `usage_usec` counter and keeps a bounded window of samples.
///
/// Owned by the reporter task; never shared.
pub struct CpuUtilizationTracker {
    cgroups: Arc<CgroupManager>,
    window: usize,
    usage_window: VecDeque<u64>,
    timestamp_window: VecDeque<i64>,
    utilization_window: VecDeque<f64>,
}

impl CpuUtilizationTracker {
    pub fn new(cgroups: Arc<CgroupManager>, window: usize) -> Self {
        Self {
            cgroups,
            window,
            usage_window: VecDeque::with_capacity(window),
            timestamp_window: VecDeque::with_capacity(window),
            utilization_window: VecDeque::with_capacity(window),
        }
    }

    /// Take one sample. The first sample is computed against zero usage at
    /// the epoch and is meaningless on its own; consumers average over the
    /// window.
    pub async fn update(&mut self) {
        let now_us = chrono::Utc::now().timestamp_micros();
        let usage_usec = self.cgroups.cpu_usage_usec().await;

        let prev_usage = self.usage_window.back().copied().unwrap_or(0);
        let prev_time = self.timestamp_window.back().copied().unwrap_or(0);
        let utilization =
            (usage_usec as f64 - prev_usage as f64) / (now_us - prev_time) as f64;

        self.usage_window.push_back(usage_usec);
        self.timestamp_window.push_back(now_us);
        self.utilization_window.push_back(utilization);

        if self.utilization_window.len() > self.window {
            self.usage_window.pop_front();
            self.timestamp_window.pop_front();
            self.utilization_window.pop_front();
        }
    }

    /// Mean of the current utilization window, 0.0 when empty.
    pub fn average_utilization(&self) -> f64 {
        if self.utilization_window.is_empty() {
            return 0.0;
        }
        self.utilization_window.iter().sum::<f64>() / self.utilization_window.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupPaths;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn fake_tree(usage_usec: u64) -> (TempDir, Arc<CgroupManager>, PathBuf) {
        let root = TempDir::new().unwrap();
        let paths = CgroupPaths::new(root.path(), "aa-bb", "cri-containerd-0");
        let container = paths.container_dir();
        fs::create_dir_all(&container).unwrap();
        let stat = container.join("cpu.stat");
        fs::write(&stat, format!("usage_usec {usage_usec}\nuser_usec 0\n")).unwrap();
        (root, Arc::new(CgroupManager::new(paths)), stat)
    }

    #[tokio::test]
    async fn empty_tracker_reports_zero() {
        let (_root, cgroups, _) = fake_tree(0);
        let tracker = CpuUtilizationTracker::new(cgroups, 4);
        assert_eq!(tracker.average_utilization(), 0.0);
    }

    #[tokio::test]
    async fn window_is_bounded() {
        let (_root, cgroups, _) = fake_tree(1_000);
        let mut tracker = CpuUtilizationTracker::new(cgroups, 3);

        for _ in 0..8 {
            tracker.update().await;
        }
        assert_eq!(tracker.utilization_window.len(), 3);
        assert_eq!(tracker.usage_window.len(), 3);
        assert_eq!(tracker.timestamp_window.len(), 3);
    }

    #[tokio::test]
    async fn derives_utilization_from_counter_deltas() {
        let (_root, cgroups, stat) = fake_tree(1_000_000);
        let mut tracker = CpuUtilizationTracker::new(cgroups, 4);

        tracker.update().await;
        fs::write(&stat, "usage_usec 1500000\n").unwrap();
        tracker.update().await;

        // The second sample is a real delta ratio; the first is the spurious
        // against-zero sample the window is there to absorb.
        let second = tracker.utilization_window[1];
        assert!(second >= 0.0);
        assert!(tracker.average_utilization() >= 0.0);
    }
}

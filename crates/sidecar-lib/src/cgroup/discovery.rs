//! Container identity discovery
//!
//! At startup the sidecar only knows its pod UID. The container id is found
//! by scanning the pod slice for the CRI child cgroup whose `cgroup.procs`
//! holds PID 1, i.e. this container's init process.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio::fs;
use tracing::debug;

const CRI_PREFIX: &str = "cri-containerd-";

/// Find this container's cgroup directory name under the pod slice.
pub async fn discover_container_id(cgroup_root: &Path, pod_uid: &str) -> Result<String> {
    let pod_dir = cgroup_root.join(super::pod_slice_name(pod_uid));
    let mut entries = fs::read_dir(&pod_dir)
        .await
        .with_context(|| format!("failed to read pod slice {}", pod_dir.display()))?;

    let mut scanned = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(CRI_PREFIX) {
            continue;
        }
        scanned += 1;

        let procs_path = entry.path().join("cgroup.procs");
        let Ok(contents) = fs::read_to_string(&procs_path).await else {
            debug!(path = %procs_path.display(), "skipping unreadable cgroup.procs");
            continue;
        };
        if contents.trim() == "1" {
            debug!(container_id = %name, scanned, "discovered container cgroup");
            return Ok(name);
        }
    }

    bail!(
        "no CRI cgroup holding PID 1 under {} ({} candidates)",
        pod_dir.display(),
        scanned
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::pod_slice_name;
    use std::fs as stdfs;
    use tempfile::TempDir;

    fn seed_cri_dir(root: &Path, pod_uid: &str, name: &str, procs: &str) {
        let dir = root.join(pod_slice_name(pod_uid)).join(name);
        stdfs::create_dir_all(&dir).unwrap();
        stdfs::write(dir.join("cgroup.procs"), procs).unwrap();
    }

    #[tokio::test]
    async fn finds_the_cgroup_holding_pid_one() {
        let root = TempDir::new().unwrap();
        seed_cri_dir(root.path(), "ab-cd", "cri-containerd-aaa", "42\n");
        seed_cri_dir(root.path(), "ab-cd", "cri-containerd-bbb", "1\n");

        let id = discover_container_id(root.path(), "ab-cd").await.unwrap();
        assert_eq!(id, "cri-containerd-bbb");
    }

    #[tokio::test]
    async fn ignores_non_cri_directories() {
        let root = TempDir::new().unwrap();
        seed_cri_dir(root.path(), "ab-cd", "something-else", "1\n");
        seed_cri_dir(root.path(), "ab-cd", "cri-containerd-ccc", "1\n");

        let id = discover_container_id(root.path(), "ab-cd").await.unwrap();
        assert_eq!(id, "cri-containerd-ccc");
    }

    #[tokio::test]
    async fn errors_when_no_candidate_matches() {
        let root = TempDir::new().unwrap();
        seed_cri_dir(root.path(), "ab-cd", "cri-containerd-aaa", "42\n");

        assert!(discover_container_id(root.path(), "ab-cd").await.is_err());
    }

    #[tokio::test]
    async fn errors_when_the_pod_slice_is_absent() {
        let root = TempDir::new().unwrap();
        assert!(discover_container_id(root.path(), "ab-cd").await.is_err());
    }
}

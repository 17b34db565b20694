//! cgroup-v2 interaction
//!
//! Path derivation for the pod's cgroup subtree, the per-request threaded
//! cgroup manager, and container identity discovery.

mod discovery;
mod manager;

pub use discovery::discover_container_id;
pub use manager::{CgroupGuard, CgroupManager};

use std::path::PathBuf;

/// Default root of the burstable pod slice hierarchy as mounted into the
/// sidecar container.
pub const DEFAULT_CGROUP_ROOT: &str = "/data/kubepods.slice/kubepods-burstable.slice";

/// Slice directory name for a burstable pod. The pod UID is embedded with
/// dashes replaced by underscores.
pub fn pod_slice_name(pod_uid: &str) -> String {
    format!("kubepods-burstable-pod{}.slice", pod_uid.replace('-', "_"))
}

/// Locations of the container cgroup and its per-request children.
#[derive(Debug, Clone)]
pub struct CgroupPaths {
    root: PathBuf,
    pod_slice: String,
    container_id: String,
}

impl CgroupPaths {
    pub fn new(
        root: impl Into<PathBuf>,
        pod_uid: &str,
        container_id: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            pod_slice: pod_slice_name(pod_uid),
            container_id: container_id.into(),
        }
    }

    /// The container's own cgroup directory.
    pub fn container_dir(&self) -> PathBuf {
        self.root.join(&self.pod_slice).join(&self.container_id)
    }

    /// The threaded child cgroup directory for one request.
    pub fn request_dir(&self, name: &str) -> PathBuf {
        self.container_dir().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_slice_name_substitutes_dashes() {
        assert_eq!(
            pod_slice_name("0ff86bad-9117-4c9d-a53c-e2ad53bf1d0c"),
            "kubepods-burstable-pod0ff86bad_9117_4c9d_a53c_e2ad53bf1d0c.slice"
        );
    }

    #[test]
    fn request_dir_nests_under_container() {
        let paths = CgroupPaths::new("/data/root", "ab-cd", "cri-containerd-0123");
        assert_eq!(
            paths.request_dir("req-1"),
            PathBuf::from("/data/root/kubepods-burstable-podab_cd.slice/cri-containerd-0123/req-1")
        );
    }
}

//! Standard host paths used by dovesnap.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Directory where named network namespaces are linked (default: /var/run/netns).
pub static NETNS_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("DOVESNAP_NETNS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/netns"))
});

/// Open vSwitch database socket (default: /var/run/openvswitch/db.sock).
pub static OVS_DB_SOCKET: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("DOVESNAP_OVS_DB_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/openvswitch/db.sock"))
});

/// Standard paths used by the driver.
#[derive(Debug, Clone)]
pub struct DovesnapPaths {
    /// Named network namespace directory.
    pub netns: PathBuf,
    /// OVS database socket.
    pub ovs_db: PathBuf,
    /// `ovs-vsctl` binary.
    pub ovs_vsctl: PathBuf,
    /// `ovs-ofctl` binary.
    pub ovs_ofctl: PathBuf,
}

impl Default for DovesnapPaths {
    fn default() -> Self {
        Self {
            netns: NETNS_DIR.clone(),
            ovs_db: OVS_DB_SOCKET.clone(),
            ovs_vsctl: PathBuf::from("/usr/bin/ovs-vsctl"),
            ovs_ofctl: PathBuf::from("/usr/bin/ovs-ofctl"),
        }
    }
}

impl DovesnapPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different netns directory.
    #[must_use]
    pub fn with_netns(mut self, dir: impl Into<PathBuf>) -> Self {
        self.netns = dir.into();
        self
    }

    /// The `--db=` argument passed to every `ovs-vsctl` call.
    #[must_use]
    pub fn ovs_db_arg(&self) -> String {
        format!("--db=unix:{}", self.ovs_db.display())
    }

    /// Link path for a container's network namespace.
    #[must_use]
    pub fn netns_link(&self, container_id: &str) -> PathBuf {
        self.netns.join(container_id)
    }

    /// The procfs network namespace of a process.
    #[must_use]
    pub fn proc_netns(pid: i64) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/net"))
    }
}

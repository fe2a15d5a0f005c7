//! Virtual ethernet pair management.

use dovesnap_common::{DovesnapResult, truncate_id};

use crate::command::run_host;
use crate::switch::{CONTAINER_PEER_PREFIX, CONTAINER_PORT_PREFIX};

/// Virtual ethernet pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side interface name, attached to the bridge.
    pub host: String,
    /// Peer interface name, moved into the container by the runtime.
    pub peer: String,
}

impl VethPair {
    /// Names of the pair for an endpoint.
    #[must_use]
    pub fn for_endpoint(endpoint_id: &str) -> Self {
        let short = truncate_id(endpoint_id);
        Self {
            host: format!("{CONTAINER_PORT_PREFIX}{short}"),
            peer: format!("{CONTAINER_PEER_PREFIX}{short}"),
        }
    }

    /// Create the pair and bring both ends up.
    pub async fn create(&self, mtu: u32) -> DovesnapResult<()> {
        tracing::debug!(host = %self.host, peer = %self.peer, mtu, "Creating veth pair");
        let mtu = mtu.to_string();

        run_host(
            "ip",
            &[
                "link",
                "add",
                self.host.as_str(),
                "mtu",
                mtu.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                self.peer.as_str(),
                "mtu",
                mtu.as_str(),
            ],
        )
        .await?;

        for name in [&self.host, &self.peer] {
            if let Err(e) = run_host("ip", &["link", "set", name.as_str(), "up"]).await {
                self.delete().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Delete the pair. Failures are logged, the peer may already be gone.
    pub async fn delete(&self) {
        tracing::debug!(host = %self.host, "Deleting veth pair");
        if let Err(e) = run_host("ip", &["link", "delete", self.host.as_str()]).await {
            tracing::warn!(host = %self.host, error = %e, "ip link delete failed");
        }
    }
}

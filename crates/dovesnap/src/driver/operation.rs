//! Messages on the resource manager's queue.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use dovesnap_common::DovesnapResult;
use dovesnap_network::{PortMapping, Protocol};

use crate::driver::state::{NetworkState, StackMirrorConfig, TopologySnapshot};

/// A host port published by a joining container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host.
    pub host_port: u16,
    /// Host address to bind, empty for any.
    pub host_ip: Option<String>,
}

impl PublishedPort {
    /// Forwarding rule to `container_ip`.
    #[must_use]
    pub fn mapping(&self, container_ip: &str) -> PortMapping {
        let mapping = match self.protocol {
            Protocol::Tcp => PortMapping::tcp(self.host_port, self.container_port, container_ip),
            Protocol::Udp => PortMapping::udp(self.host_port, self.container_port, container_ip),
        };
        match self.host_ip.as_deref().filter(|ip| !ip.is_empty()) {
            Some(ip) => mapping.with_host_ip(ip),
            None => mapping,
        }
    }
}

/// What the runtime needs back from a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    /// Interface to move into the container.
    pub src_name: String,
    /// Name prefix it gets inside the container.
    pub dst_prefix: String,
    /// Gateway address, if the network has one.
    pub gateway: Option<String>,
}

/// One lifecycle operation and the channel its result goes back on.
#[derive(Debug)]
pub enum Operation {
    /// Create a network.
    Create {
        /// Pre-computed state.
        state: Box<NetworkState>,
        /// Pre-computed mirroring parameters.
        stack_mirror: StackMirrorConfig,
        /// Result.
        reply: oneshot::Sender<DovesnapResult<()>>,
    },
    /// Delete a network.
    Delete {
        /// Network id.
        network_id: String,
        /// Result.
        reply: oneshot::Sender<DovesnapResult<()>>,
    },
    /// Attach a container endpoint.
    Join {
        /// Network id.
        network_id: String,
        /// Endpoint id.
        endpoint_id: String,
        /// Ports to publish.
        published: Vec<PublishedPort>,
        /// Result.
        reply: oneshot::Sender<DovesnapResult<JoinInfo>>,
    },
    /// Detach a container endpoint.
    Leave {
        /// Network id.
        network_id: String,
        /// Endpoint id.
        endpoint_id: String,
        /// Result.
        reply: oneshot::Sender<DovesnapResult<()>>,
    },
    /// Copy the topology.
    Query {
        /// Result.
        reply: oneshot::Sender<TopologySnapshot>,
    },
}

impl Operation {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Query { .. } => "query",
        }
    }
}

//! Container runtime queries.
//!
//! The runtime is only ever read: network metadata for restart recovery
//! and network names, container metadata for joins. Everything the driver
//! itself just created may not be visible yet, so lookups go through
//! [`dovesnap_common::retry`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::Docker;

use dovesnap_common::{DovesnapError, DovesnapResult, RetryPolicy, retry};

use crate::config::parse_bool;

/// Driver name networks are created with (`docker network create -d ovs`).
pub const DRIVER_NAME: &str = "ovs";

/// Container label naming the ingress ACLs of its port.
pub const LABEL_PORT_ACL: &str = "dovesnap.faucet.portacl";
/// Container label enabling mirroring of its port.
pub const LABEL_MIRROR: &str = "dovesnap.faucet.mirror";
/// Container label replacing the leading octets of its MAC.
pub const LABEL_MAC_PREFIX: &str = "dovesnap.faucet.mac_prefix";

/// One IPAM pool of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpamConfig {
    /// Subnet in CIDR form.
    pub subnet: Option<String>,
    /// Gateway address without prefix length.
    pub gateway: Option<String>,
}

/// A container's attachment as seen in a network inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkEndpoint {
    /// Endpoint id assigned by the runtime.
    pub endpoint_id: String,
    /// MAC address.
    pub mac_address: Option<String>,
    /// IPv4 address in CIDR form.
    pub ipv4_address: Option<String>,
}

/// The parts of a runtime network the driver uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkResource {
    /// Network id.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Driver that owns the network.
    pub driver: String,
    /// Created with `--internal`.
    pub internal: bool,
    /// Driver options (`-o key=value`).
    pub options: HashMap<String, String>,
    /// IPAM pools.
    pub ipam: Vec<IpamConfig>,
    /// Attached containers by container id. Only filled by inspect.
    pub containers: BTreeMap<String, NetworkEndpoint>,
}

/// The parts of a container the driver uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container id.
    pub id: String,
    /// Container name without the leading `/`.
    pub name: String,
    /// Pid of the container's init process.
    pub pid: i64,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// MAC address on the network being joined.
    pub mac_address: Option<String>,
    /// IPv4 address on the network being joined, without prefix length.
    pub ip_address: Option<String>,
}

impl ContainerInfo {
    /// Value of a label, if set and non-empty.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Whether the mirror label is set to a true value.
    #[must_use]
    pub fn wants_mirror(&self) -> bool {
        mirror_requested(&self.labels)
    }
}

/// Whether `labels` ask for the container's port to be mirrored.
#[must_use]
pub fn mirror_requested(labels: &HashMap<String, String>) -> bool {
    labels
        .get(LABEL_MIRROR)
        .map(String::as_str)
        .and_then(parse_bool)
        .unwrap_or(false)
}

/// Read-only view of the container runtime.
#[async_trait]
pub trait RuntimeInspector: Send + Sync {
    /// Identifier of the runtime engine on this host.
    async fn engine_id(&self) -> DovesnapResult<String>;

    /// All networks, without their container lists.
    async fn list_networks(&self) -> DovesnapResult<Vec<NetworkResource>>;

    /// One network with its containers.
    async fn inspect_network(&self, id: &str) -> DovesnapResult<NetworkResource>;

    /// One container.
    async fn inspect_container(&self, id: &str) -> DovesnapResult<ContainerInfo>;
}

/// Look up a network, retrying while the runtime has not caught up.
///
/// # Errors
///
/// Returns the last lookup error once the policy is exhausted.
pub async fn network_with_retry(
    runtime: &dyn RuntimeInspector,
    network_id: &str,
    policy: RetryPolicy,
) -> DovesnapResult<NetworkResource> {
    retry(policy, "inspect network", || runtime.inspect_network(network_id)).await
}

/// Networks owned by this driver, fully inspected.
///
/// # Errors
///
/// Returns an error if the runtime cannot list or inspect networks.
pub async fn driver_networks(runtime: &dyn RuntimeInspector) -> DovesnapResult<Vec<NetworkResource>> {
    let mut networks = Vec::new();
    for summary in runtime.list_networks().await? {
        if summary.driver != DRIVER_NAME {
            continue;
        }
        networks.push(runtime.inspect_network(&summary.id).await?);
    }
    Ok(networks)
}

/// Find the container attached through `endpoint_id` on network `network_id`.
///
/// The returned MAC and IP address are those of that attachment.
///
/// # Errors
///
/// Returns [`DovesnapError::EndpointNotFound`] if the endpoint never shows
/// up within the policy.
pub async fn container_for_endpoint(
    runtime: &dyn RuntimeInspector,
    network_id: &str,
    endpoint_id: &str,
    policy: RetryPolicy,
) -> DovesnapResult<ContainerInfo> {
    retry(policy, "resolve endpoint", || async {
        let network = runtime.inspect_network(network_id).await?;
        let (container_id, endpoint) = network
            .containers
            .iter()
            .find(|(_, endpoint)| endpoint.endpoint_id == endpoint_id)
            .ok_or_else(|| DovesnapError::EndpointNotFound {
                id: endpoint_id.to_string(),
            })?;
        let mut container = runtime.inspect_container(container_id).await?;
        container.mac_address.clone_from(&endpoint.mac_address);
        container.ip_address = endpoint
            .ipv4_address
            .as_deref()
            .map(|cidr| cidr.split('/').next().unwrap_or(cidr).to_string());
        Ok(container)
    })
    .await
}

/// [`RuntimeInspector`] over the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerInspector {
    docker: Docker,
}

impl DockerInspector {
    /// Connect with the local defaults (`DOCKER_HOST` or the Unix socket).
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be configured.
    pub fn connect() -> DovesnapResult<Self> {
        Docker::connect_with_local_defaults()
            .map(Self::new)
            .map_err(runtime_error)
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn runtime_error(err: bollard::errors::Error) -> DovesnapError {
    DovesnapError::Runtime {
        message: err.to_string(),
    }
}

fn network_resource(network: bollard::models::Network) -> NetworkResource {
    NetworkResource {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        driver: network.driver.unwrap_or_default(),
        internal: network.internal.unwrap_or_default(),
        options: network.options.unwrap_or_default(),
        ipam: network
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .map(|pool| IpamConfig {
                subnet: pool.subnet,
                gateway: pool.gateway,
            })
            .collect(),
        containers: network
            .containers
            .unwrap_or_default()
            .into_iter()
            .map(|(id, container)| {
                (
                    id,
                    NetworkEndpoint {
                        endpoint_id: container.endpoint_id.unwrap_or_default(),
                        mac_address: container.mac_address.filter(|mac| !mac.is_empty()),
                        ipv4_address: container.ipv4_address.filter(|ip| !ip.is_empty()),
                    },
                )
            })
            .collect(),
    }
}

#[async_trait]
impl RuntimeInspector for DockerInspector {
    async fn engine_id(&self) -> DovesnapResult<String> {
        let info = self.docker.info().await.map_err(runtime_error)?;
        info.id.ok_or_else(|| DovesnapError::Runtime {
            message: "engine did not report an id".into(),
        })
    }

    async fn list_networks(&self) -> DovesnapResult<Vec<NetworkResource>> {
        let networks = self
            .docker
            .list_networks(None::<bollard::network::ListNetworksOptions<String>>)
            .await
            .map_err(runtime_error)?;
        Ok(networks.into_iter().map(network_resource).collect())
    }

    async fn inspect_network(&self, id: &str) -> DovesnapResult<NetworkResource> {
        match self
            .docker
            .inspect_network(id, None::<bollard::network::InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => Ok(network_resource(network)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(DovesnapError::NetworkNotFound { id: id.to_string() }),
            Err(e) => Err(runtime_error(e)),
        }
    }

    async fn inspect_container(&self, id: &str) -> DovesnapResult<ContainerInfo> {
        let container = match self
            .docker
            .inspect_container(id, None::<bollard::container::InspectContainerOptions>)
            .await
        {
            Ok(container) => container,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(DovesnapError::EndpointNotFound { id: id.to_string() }),
            Err(e) => return Err(runtime_error(e)),
        };
        Ok(ContainerInfo {
            id: container.id.unwrap_or_else(|| id.to_string()),
            name: container
                .name
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            pid: container.state.and_then(|state| state.pid).unwrap_or_default(),
            labels: container
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
            mac_address: None,
            ip_address: None,
        })
    }
}

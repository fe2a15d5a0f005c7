//! The resource manager.
//!
//! One task owns every [`NetworkState`], [`StackMirrorConfig`] and
//! in-flight container handle. Plugin callbacks reach it only through a
//! [`ManagerHandle`], which queues an [`Operation`] and waits for its
//! reply. Operations run one at a time, to completion, so topology state
//! needs no locking. A failed operation is logged and reported to its
//! caller; it never stops the queue.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use dovesnap_common::{DovesnapError, DovesnapResult, truncate_id};
use dovesnap_faucet::{
    FaucetConfig, FaucetDoc, RemoteMirror, mirror_interface, parse_acls, stack_interface,
    vlan_interface,
};
use dovesnap_network::switch::{CONTAINER_ETH_PREFIX, MIRROR_BRIDGE, OFPP_LOCAL};
use dovesnap_network::{
    BridgeSpec, DhcpClient, HostNetwork, PortMapper, PortMapping, SwitchControl, VethPair,
    apply_mac_prefix, patch_port_name,
};

use crate::config::DriverSettings;
use crate::docker::{
    self, ContainerInfo, LABEL_MAC_PREFIX, LABEL_PORT_ACL, NetworkResource, RuntimeInspector,
};
use crate::driver::operation::{JoinInfo, Operation, PublishedPort};
use crate::driver::options::{BridgeMode, NetworkOptions};
use crate::driver::state::{
    ContainerState, NetworkSnapshot, NetworkState, StackMirrorConfig, TopologySnapshot,
};
use crate::stack::{MIRROR_OUT_PORT, StackIdentity};

/// The external systems the manager drives.
#[derive(Clone)]
pub struct Adapters {
    /// Virtual switch.
    pub switch: Arc<dyn SwitchControl>,
    /// Host plumbing.
    pub host: Arc<dyn HostNetwork>,
    /// Controller configuration service.
    pub faucet: Arc<dyn FaucetConfig>,
    /// Container runtime.
    pub runtime: Arc<dyn RuntimeInspector>,
}

/// Host side effects of an attached container, undone on leave.
#[derive(Debug)]
struct ContainerHandle {
    network_id: String,
    veth: VethPair,
    ofport: u32,
    netns_link: Option<PathBuf>,
    dhcp: Option<DhcpClient>,
    port_mapper: Option<PortMapper>,
    mappings: Vec<PortMapping>,
    mirrored: bool,
}

impl ContainerHandle {
    fn new(network_id: &str, veth: VethPair, ofport: u32) -> Self {
        Self {
            network_id: network_id.to_string(),
            veth,
            ofport,
            netns_link: None,
            dhcp: None,
            port_mapper: None,
            mappings: Vec::new(),
            mirrored: false,
        }
    }
}

/// Queues operations for the resource manager. Cheap to clone.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Operation>,
    settings: Arc<DriverSettings>,
}

impl ManagerHandle {
    /// Driver settings.
    #[must_use]
    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Operation) -> DovesnapResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| DovesnapError::QueueClosed)?;
        rx.await.map_err(|_| DovesnapError::QueueClosed)
    }

    /// Create a network. Returns once its bridge is programmed.
    ///
    /// # Errors
    ///
    /// Returns the switch or host error that stopped the creation.
    pub async fn create_network(&self, options: NetworkOptions) -> DovesnapResult<()> {
        let stack_mirror = StackMirrorConfig::for_network(&options, &self.settings);
        let state = Box::new(NetworkState::new(options, &self.settings));
        self.request(|reply| Operation::Create {
            state,
            stack_mirror,
            reply,
        })
        .await?
    }

    /// Delete a network.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller refuses to drop the datapath.
    /// Deleting an unknown network succeeds.
    pub async fn delete_network(&self, network_id: &str) -> DovesnapResult<()> {
        self.request(|reply| Operation::Delete {
            network_id: network_id.to_string(),
            reply,
        })
        .await?
    }

    /// Attach an endpoint. Returns once its switch port exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unknown or the port cannot be
    /// created.
    pub async fn join(
        &self,
        network_id: &str,
        endpoint_id: &str,
        published: Vec<PublishedPort>,
    ) -> DovesnapResult<JoinInfo> {
        self.request(|reply| Operation::Join {
            network_id: network_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
            published,
            reply,
        })
        .await?
    }

    /// Detach an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unknown or the endpoint's port
    /// cannot be found.
    pub async fn leave(&self, network_id: &str, endpoint_id: &str) -> DovesnapResult<()> {
        self.request(|reply| Operation::Leave {
            network_id: network_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
            reply,
        })
        .await?
    }

    /// Copy the current topology.
    ///
    /// # Errors
    ///
    /// Returns [`DovesnapError::QueueClosed`] if the manager has stopped.
    pub async fn query(&self) -> DovesnapResult<TopologySnapshot> {
        self.request(|reply| Operation::Query { reply }).await
    }
}

/// Owner of all topology state.
pub struct ResourceManager {
    adapters: Adapters,
    settings: Arc<DriverSettings>,
    identity: Option<StackIdentity>,
    networks: BTreeMap<String, NetworkState>,
    stack_mirrors: BTreeMap<String, StackMirrorConfig>,
    containers: HashMap<String, ContainerHandle>,
    rx: mpsc::Receiver<Operation>,
}

impl ResourceManager {
    /// Create the manager and the handle that feeds it.
    ///
    /// `identity` names the stacking and loopback bridges; it is required
    /// for stacking to take effect.
    #[must_use]
    pub fn new(
        adapters: Adapters,
        settings: Arc<DriverSettings>,
        identity: Option<StackIdentity>,
    ) -> (Self, ManagerHandle) {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let handle = ManagerHandle {
            tx,
            settings: Arc::clone(&settings),
        };
        let manager = Self {
            adapters,
            settings,
            identity,
            networks: BTreeMap::new(),
            stack_mirrors: BTreeMap::new(),
            containers: HashMap::new(),
            rx,
        };
        (manager, handle)
    }

    fn stack_identity(&self) -> Option<&StackIdentity> {
        self.identity
            .as_ref()
            .filter(|_| self.settings.using_stacking())
    }

    fn mirroring(&self) -> bool {
        self.settings.using_mirror_bridge() || self.settings.using_stack_mirroring()
    }

    /// Rebuild state for networks this driver created before a restart.
    ///
    /// Must run before [`ResourceManager::run`]. Networks whose options no
    /// longer parse are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    pub async fn rehydrate(&mut self) -> DovesnapResult<usize> {
        let resources = docker::driver_networks(self.adapters.runtime.as_ref()).await?;
        let mut restored = 0;
        for resource in resources {
            let options = match NetworkOptions::from_resource(&resource) {
                Ok(options) => options,
                Err(e) => {
                    tracing::error!(network_id = %resource.id, error = %e, "Cannot restore network");
                    continue;
                }
            };
            let stack_mirror = StackMirrorConfig::for_network(&options, &self.settings);
            let mut state = NetworkState::new(options, &self.settings).with_name(&resource.name);
            self.restore_ports(&mut state, &resource).await;
            tracing::info!(
                network_id = %state.network_id,
                network = %state.network_name,
                bridge = %state.bridge_name,
                containers = state.containers.len(),
                "Restored network"
            );
            self.stack_mirrors
                .insert(state.network_id.clone(), stack_mirror);
            self.networks.insert(state.network_id.clone(), state);
            restored += 1;
        }
        Ok(restored)
    }

    async fn restore_ports(&self, state: &mut NetworkState, resource: &NetworkResource) {
        let switch = self.adapters.switch.as_ref();
        for port in state.bridge_ports() {
            match switch.port_number(&port.name).await {
                Ok(ofport) => state.add_external_port(port.name, ofport),
                Err(e) => tracing::debug!(port = %port.name, error = %e, "Static port not on bridge"),
            }
        }
        for (container_id, endpoint) in &resource.containers {
            let veth = VethPair::for_endpoint(&endpoint.endpoint_id);
            let ofport = match switch.port_number(&veth.host).await {
                Ok(ofport) => ofport,
                Err(e) => {
                    tracing::debug!(port = %veth.host, error = %e, "Container port not on bridge");
                    continue;
                }
            };
            let container = match self.adapters.runtime.inspect_container(container_id).await {
                Ok(container) => container,
                Err(e) => {
                    tracing::debug!(container_id = %container_id, error = %e, "Cannot inspect container");
                    continue;
                }
            };
            state.containers.insert(
                endpoint.endpoint_id.clone(),
                ContainerState {
                    name: container.name,
                    id: container.id,
                    ofport,
                    mac_address: endpoint.mac_address.clone(),
                    host_ip: endpoint
                        .ipv4_address
                        .as_deref()
                        .and_then(|cidr| cidr.split('/').next())
                        .map(String::from),
                    labels: container.labels,
                },
            );
        }
    }

    /// Drain the queue until every [`ManagerHandle`] is dropped.
    pub async fn run(mut self) {
        tracing::info!(networks = self.networks.len(), "Resource manager started");
        while let Some(op) = self.rx.recv().await {
            self.dispatch(op).await;
        }
        for (endpoint_id, handle) in std::mem::take(&mut self.containers) {
            tracing::debug!(%endpoint_id, "Releasing container handle");
            self.release(handle).await;
        }
        tracing::info!("Resource manager stopped");
    }

    async fn dispatch(&mut self, op: Operation) {
        tracing::debug!(kind = op.kind(), "Processing operation");
        match op {
            Operation::Create {
                state,
                stack_mirror,
                reply,
            } => {
                let network_id = state.network_id.clone();
                match self.create_network(*state, stack_mirror).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        if let Err(e) = self.finish_create(&network_id).await {
                            tracing::error!(%network_id, error = %e, "Network creation failed");
                            self.unwind_create(&network_id).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!(%network_id, error = %e, "Network creation failed");
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Operation::Delete { network_id, reply } => {
                let result = self.delete_network(&network_id).await;
                if let Err(e) = &result {
                    tracing::error!(%network_id, error = %e, "Network deletion failed");
                }
                let _ = reply.send(result);
            }
            Operation::Join {
                network_id,
                endpoint_id,
                published,
                reply,
            } => match self.join(&network_id, &endpoint_id).await {
                Ok(info) => {
                    let _ = reply.send(Ok(info));
                    if let Err(e) = self.finish_join(&network_id, &endpoint_id, &published).await {
                        tracing::error!(%network_id, %endpoint_id, error = %e, "Join failed");
                    }
                }
                Err(e) => {
                    tracing::error!(%network_id, %endpoint_id, error = %e, "Join failed");
                    let _ = reply.send(Err(e));
                }
            },
            Operation::Leave {
                network_id,
                endpoint_id,
                reply,
            } => {
                let result = self.leave(&network_id, &endpoint_id).await;
                if let Err(e) = &result {
                    tracing::error!(%network_id, %endpoint_id, error = %e, "Leave failed");
                }
                let _ = reply.send(result);
            }
            Operation::Query { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            networks: self
                .networks
                .iter()
                .map(|(id, state)| NetworkSnapshot {
                    state: state.clone(),
                    stack_mirror: self.stack_mirrors.get(id).cloned().unwrap_or_default(),
                })
                .collect(),
        }
    }

    async fn create_network(
        &mut self,
        state: NetworkState,
        stack_mirror: StackMirrorConfig,
    ) -> DovesnapResult<()> {
        if self.networks.contains_key(&state.network_id) {
            return Err(DovesnapError::invalid_option(
                "network",
                state.network_id.clone(),
                "network already exists",
            ));
        }
        tracing::info!(
            network_id = %state.network_id,
            bridge = %state.bridge_name,
            dpid = %state.dpid,
            mode = %state.mode,
            "Creating network"
        );
        let spec = BridgeSpec {
            name: state.bridge_name.clone(),
            controllers: state.controllers.clone(),
            dpid: Some(state.dpid),
            add_ports: state.bridge_ports(),
            may_exist: true,
            userspace: state.userspace,
            local_mac: state.ovs_local_mac.clone(),
        };
        self.adapters.switch.create_bridge(&spec).await?;

        if state.mode == BridgeMode::Nat {
            match &state.gateway {
                Some(gateway) => {
                    if let Err(e) = self
                        .adapters
                        .host
                        .setup_nat(&state.bridge_name, &gateway.address, &gateway.mask)
                        .await
                    {
                        self.remove_bridge(&state).await;
                        return Err(e);
                    }
                }
                None => tracing::warn!(bridge = %state.bridge_name, "NAT network has no gateway"),
            }
        }

        self.stack_mirrors
            .insert(state.network_id.clone(), stack_mirror);
        self.networks.insert(state.network_id.clone(), state);
        Ok(())
    }

    /// Everything after the bridge exists: learn the network name, patch
    /// into the host-level bridges and push one document for it all.
    async fn finish_create(&mut self, network_id: &str) -> DovesnapResult<()> {
        let resource = docker::network_with_retry(
            self.adapters.runtime.as_ref(),
            network_id,
            self.settings.runtime_retry,
        )
        .await?;
        let mut state = self
            .networks
            .get(network_id)
            .cloned()
            .ok_or_else(|| DovesnapError::NetworkNotFound {
                id: network_id.to_string(),
            })?
            .with_name(&resource.name);
        let stack_mirror = self.stack_mirrors.get(network_id).cloned().unwrap_or_default();
        let switch = self.adapters.switch.as_ref();
        let dp_name = state.network_name.clone();
        let bridge = state.bridge_name.clone();
        let vlan = state.vlan;

        let mut interfaces = Vec::new();
        for port in state.bridge_ports() {
            let ofport = switch.port_number(&port.name).await?;
            interfaces.push((
                ofport,
                vlan_interface(format!("Physical interface {}", port.name), vlan, Vec::new()),
            ));
            state.add_external_port(port.name, ofport);
        }
        if state.mode == BridgeMode::Nat {
            let acls = state.nat_acl.as_deref().map(parse_acls).unwrap_or_default();
            interfaces.push((OFPP_LOCAL, vlan_interface("OVS Port for NAT", vlan, acls)));
            state.add_external_port(bridge.clone(), OFPP_LOCAL);
        }
        let mut doc = FaucetDoc::bridge(&dp_name, state.dp_id, &bridge, interfaces);

        if self.settings.using_mirror_bridge() {
            let (ofport, mirror_ofport) = switch
                .add_patch_port(&bridge, MIRROR_BRIDGE, Some(stack_mirror.lb_port), None)
                .await?;
            switch
                .add_flow(
                    MIRROR_BRIDGE,
                    &format!(
                        "priority=2,in_port={mirror_ofport},actions=mod_vlan_vid:{vlan},output:{MIRROR_OUT_PORT}"
                    ),
                )
                .await?;
            doc.add_interfaces(&dp_name, [(ofport, mirror_interface())]);
            state.add_external_port(patch_port_name(&bridge, MIRROR_BRIDGE), ofport);
        }

        if let Some(identity) = self.stack_identity() {
            let stack_dp = identity.dp_name();
            let (ofport, stack_ofport) = switch.add_patch_port(&bridge, &stack_dp, None, None).await?;
            doc.add_interfaces(&dp_name, [(ofport, stack_interface(&stack_dp, stack_ofport))])
                .add_interfaces(&stack_dp, [(stack_ofport, stack_interface(&dp_name, ofport))]);
            state.add_external_port(patch_port_name(&bridge, &stack_dp), ofport);
        }

        self.adapters.faucet.set_config(&doc).await?;

        if let Some(identity) = self.stack_identity().filter(|_| self.settings.using_stack_mirroring()) {
            let loopback = identity.loopback_bridge();
            let (ofport, _) = switch
                .add_patch_port(&bridge, &loopback, Some(stack_mirror.lb_port), None)
                .await?;
            self.adapters
                .faucet
                .set_remote_mirror_port(&RemoteMirror {
                    dp_name: dp_name.clone(),
                    port: ofport,
                    tunnel_vid: stack_mirror.tunnel_vid,
                    remote_dp_name: stack_mirror.remote_dp_name.clone(),
                    remote_port: stack_mirror.remote_mirror_port,
                })
                .await?;
            state.add_external_port(patch_port_name(&bridge, &loopback), ofport);
        }

        tracing::info!(
            %network_id,
            network = %dp_name,
            %bridge,
            ports = state.external_ports.len(),
            "Network created"
        );
        self.networks.insert(network_id.to_string(), state);
        Ok(())
    }

    /// Host-level bridges every network is patched into.
    fn patch_peers(&self) -> Vec<String> {
        let mut peers = Vec::new();
        if self.settings.using_mirror_bridge() {
            peers.push(MIRROR_BRIDGE.to_string());
        }
        if let Some(identity) = self.stack_identity() {
            peers.push(identity.dp_name());
            if self.settings.using_stack_mirroring() {
                peers.push(identity.loopback_bridge());
            }
        }
        peers
    }

    /// Remove a network's bridge, its patch links and its masquerade rule.
    /// Failures are logged and skipped.
    async fn remove_bridge(&self, state: &NetworkState) {
        let switch = self.adapters.switch.as_ref();
        let bridge = &state.bridge_name;
        for peer in self.patch_peers() {
            if let Err(e) = switch.delete_patch_port(bridge, &peer).await {
                tracing::warn!(%bridge, %peer, error = %e, "Cannot delete patch link");
            }
        }
        if let Err(e) = switch.delete_bridge(bridge).await {
            tracing::warn!(%bridge, error = %e, "Cannot delete bridge");
        }
        if state.mode == BridgeMode::Nat {
            if let Some(gateway) = &state.gateway {
                if let Err(e) = self
                    .adapters
                    .host
                    .teardown_nat(&gateway.address, &gateway.mask)
                    .await
                {
                    tracing::warn!(%bridge, error = %e, "Cannot remove masquerade");
                }
            }
        }
    }

    /// Undo a create whose second phase failed.
    async fn unwind_create(&mut self, network_id: &str) {
        self.stack_mirrors.remove(network_id);
        if let Some(state) = self.networks.remove(network_id) {
            tracing::info!(%network_id, bridge = %state.bridge_name, "Removing partially created network");
            self.remove_bridge(&state).await;
        }
    }

    async fn delete_network(&mut self, network_id: &str) -> DovesnapResult<()> {
        let Some(state) = self.networks.get(network_id) else {
            tracing::info!(%network_id, "Network not known, nothing to delete");
            return Ok(());
        };
        tracing::info!(
            %network_id,
            network = %state.network_name,
            bridge = %state.bridge_name,
            "Deleting network"
        );

        if !state.network_name.is_empty() {
            self.adapters.faucet.delete_dp(&state.network_name).await?;
        }
        self.remove_bridge(state).await;
        let bridge = state.bridge_name.clone();

        let orphans: Vec<String> = self
            .containers
            .iter()
            .filter(|(_, handle)| handle.network_id == network_id)
            .map(|(endpoint_id, _)| endpoint_id.clone())
            .collect();
        for endpoint_id in orphans {
            if let Some(handle) = self.containers.remove(&endpoint_id) {
                self.adapters.host.delete_veth(&handle.veth).await;
                self.release(handle).await;
            }
        }

        self.networks.remove(network_id);
        self.stack_mirrors.remove(network_id);
        tracing::info!(%network_id, %bridge, "Network deleted");
        Ok(())
    }

    async fn join(&mut self, network_id: &str, endpoint_id: &str) -> DovesnapResult<JoinInfo> {
        let state = self
            .networks
            .get(network_id)
            .ok_or_else(|| DovesnapError::NetworkNotFound {
                id: network_id.to_string(),
            })?;
        let veth = VethPair::for_endpoint(endpoint_id);
        self.adapters.host.create_veth(&veth, state.mtu).await?;
        let ofport = match self
            .adapters
            .switch
            .add_internal_port(&state.bridge_name, &veth.host, None, None)
            .await
        {
            Ok(ofport) => ofport,
            Err(e) => {
                self.adapters.host.delete_veth(&veth).await;
                return Err(e);
            }
        };
        tracing::info!(
            %network_id,
            %endpoint_id,
            port = %veth.host,
            bridge = %state.bridge_name,
            ofport,
            "Attached endpoint"
        );
        let info = JoinInfo {
            src_name: veth.peer.clone(),
            dst_prefix: CONTAINER_ETH_PREFIX.to_string(),
            gateway: state.gateway.as_ref().map(|gw| gw.address.clone()),
        };
        self.containers.insert(
            endpoint_id.to_string(),
            ContainerHandle::new(network_id, veth, ofport),
        );
        Ok(info)
    }

    /// Everything after the switch port exists. The handle records each
    /// side effect as it happens so a later leave can undo it.
    async fn finish_join(
        &mut self,
        network_id: &str,
        endpoint_id: &str,
        published: &[PublishedPort],
    ) -> DovesnapResult<()> {
        let container = docker::container_for_endpoint(
            self.adapters.runtime.as_ref(),
            network_id,
            endpoint_id,
            self.settings.runtime_retry,
        )
        .await?;
        let mirroring = self.mirroring();
        let state = self
            .networks
            .get(network_id)
            .ok_or_else(|| DovesnapError::NetworkNotFound {
                id: network_id.to_string(),
            })?;
        let lb_port = self
            .stack_mirrors
            .get(network_id)
            .map_or(state.lb_port, |mirror| mirror.lb_port);
        let handle = self
            .containers
            .get_mut(endpoint_id)
            .ok_or_else(|| DovesnapError::EndpointNotFound {
                id: endpoint_id.to_string(),
            })?;
        let host = self.adapters.host.as_ref();

        handle.netns_link = Some(host.link_netns(container.pid, &container.id).await?);

        let mut mac_address = container.mac_address.clone();
        if let (Some(prefix), Some(mac)) = (container.label(LABEL_MAC_PREFIX), &container.mac_address) {
            let rewritten = apply_mac_prefix(prefix, mac)?;
            host.set_container_mac(&container.id, mac, &rewritten).await?;
            tracing::debug!(container = %container.name, %rewritten, "Rewrote container MAC");
            mac_address = Some(rewritten);
        }

        if state.dhcp {
            handle.dhcp = Some(host.start_dhcp(&container.id).await?);
        }

        if state.mode == BridgeMode::Nat && !published.is_empty() {
            match &container.ip_address {
                Some(ip) => {
                    let mapper = handle
                        .port_mapper
                        .insert(PortMapper::new(&state.bridge_name, endpoint_id));
                    for port in published {
                        let mapping = port.mapping(ip);
                        host.add_port_mapping(mapper, &mapping).await?;
                        handle.mappings.push(mapping);
                    }
                }
                None => tracing::warn!(%endpoint_id, "No address to publish ports to"),
            }
        }

        let doc = FaucetDoc::bridge(
            &state.network_name,
            state.dp_id,
            &state.bridge_name,
            [(handle.ofport, container_interface(&container, state.vlan))],
        );
        self.adapters.faucet.set_config(&doc).await?;

        if mirroring && container.wants_mirror() {
            self.adapters
                .faucet
                .add_port_mirror(&state.network_name, handle.ofport, lb_port)
                .await?;
            handle.mirrored = true;
        }

        let ofport = handle.ofport;
        tracing::info!(
            %network_id,
            %endpoint_id,
            container = %container.name,
            ofport,
            "Endpoint ready"
        );
        if let Some(state) = self.networks.get_mut(network_id) {
            state.containers.insert(
                endpoint_id.to_string(),
                ContainerState {
                    name: container.name,
                    id: container.id,
                    ofport,
                    mac_address,
                    host_ip: container.ip_address,
                    labels: container.labels,
                },
            );
        }
        Ok(())
    }

    async fn leave(&mut self, network_id: &str, endpoint_id: &str) -> DovesnapResult<()> {
        let handle = self.containers.remove(endpoint_id);
        let Some(state) = self.networks.get(network_id) else {
            if let Some(handle) = handle {
                self.adapters.host.delete_veth(&handle.veth).await;
                self.release(handle).await;
            }
            return Err(DovesnapError::NetworkNotFound {
                id: network_id.to_string(),
            });
        };
        let recorded = state.containers.get(endpoint_id);
        let veth = handle
            .as_ref()
            .map_or_else(|| VethPair::for_endpoint(endpoint_id), |h| h.veth.clone());
        let ofport = match (handle.as_ref(), recorded) {
            (Some(handle), _) => handle.ofport,
            (None, Some(container)) => container.ofport,
            (None, None) => self.adapters.switch.port_number(&veth.host).await?,
        };
        let mirrored = match (handle.as_ref(), recorded) {
            (Some(handle), _) => handle.mirrored,
            (None, Some(container)) => docker::mirror_requested(&container.labels),
            (None, None) => false,
        };
        let dp_name = state.network_name.clone();
        let bridge = state.bridge_name.clone();
        let lb_port = self
            .stack_mirrors
            .get(network_id)
            .map_or(state.lb_port, |mirror| mirror.lb_port);

        if let Some(handle) = handle {
            self.release(handle).await;
        }
        if mirrored && self.mirroring() {
            if let Err(e) = self
                .adapters
                .faucet
                .remove_port_mirror(&dp_name, ofport, lb_port)
                .await
            {
                tracing::warn!(%endpoint_id, ofport, error = %e, "Cannot remove port mirror");
            }
        }
        if let Err(e) = self.adapters.switch.delete_port(&bridge, &veth.host).await {
            tracing::warn!(%bridge, port = %veth.host, error = %e, "Cannot delete port");
        }
        self.adapters.host.delete_veth(&veth).await;
        if let Err(e) = self
            .adapters
            .faucet
            .delete_dp_interfaces(&dp_name, &[ofport])
            .await
        {
            tracing::warn!(network = %dp_name, ofport, error = %e, "Cannot remove interface");
        }

        if let Some(state) = self.networks.get_mut(network_id) {
            state.containers.remove(endpoint_id);
        }
        tracing::info!(%network_id, %endpoint_id, port = %veth.host, ofport, "Detached endpoint");
        Ok(())
    }

    async fn release(&self, handle: ContainerHandle) {
        let host = self.adapters.host.as_ref();
        if let Some(dhcp) = handle.dhcp {
            dhcp.stop().await;
        }
        if let Some(mapper) = &handle.port_mapper {
            for mapping in &handle.mappings {
                host.remove_port_mapping(mapper, mapping).await;
            }
        }
        if let Some(link) = &handle.netns_link {
            if let Err(e) = host.unlink_netns(link).await {
                tracing::warn!(link = %link.display(), error = %e, "Cannot remove namespace link");
            }
        }
    }
}

/// Controller interface of a container port: `<name> <short id>` on the
/// network VLAN with the ACLs from its label.
fn container_interface(container: &ContainerInfo, vlan: u16) -> dovesnap_faucet::InterfaceDoc {
    let acls = container.label(LABEL_PORT_ACL).map(parse_acls).unwrap_or_default();
    vlan_interface(
        format!("{} {}", container.name, truncate_id(&container.id)),
        vlan,
        acls,
    )
}

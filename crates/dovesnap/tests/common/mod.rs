//! In-memory switch, host, controller and runtime for driving the manager.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dovesnap::docker::{ContainerInfo, DRIVER_NAME, NetworkEndpoint, NetworkResource, RuntimeInspector};
use dovesnap::driver::{Adapters, NetworkOptions};
use dovesnap::{DriverSettings, ManagerHandle, ResourceManager};
use dovesnap_common::{DovesnapError, DovesnapResult, RetryPolicy};
use dovesnap_faucet::{FaucetConfig, FaucetDoc, RemoteMirror};
use dovesnap_network::switch::lowest_free_port;
use dovesnap_network::{
    BridgeSpec, DhcpClient, HostNetwork, PortMapper, PortMapping, PortTable, SwitchControl,
    VethPair, patch_port_name,
};

fn missing(what: &str) -> DovesnapError {
    DovesnapError::config(format!("no such {what}"))
}

/// Bridges as port tables, plus every flow installed.
#[derive(Default)]
pub struct MockSwitch {
    pub bridges: Mutex<BTreeMap<String, PortTable>>,
    pub flows: Mutex<Vec<(String, String)>>,
    pub fail_create: Mutex<bool>,
    pub creates: Mutex<usize>,
}

impl MockSwitch {
    pub fn plug(&self, bridge: &str, ofport: u32, name: &str) {
        self.bridges
            .lock()
            .unwrap()
            .entry(bridge.to_string())
            .or_default()
            .insert(ofport, name.to_string());
    }

    pub fn unplug(&self, bridge: &str, ofport: u32) {
        if let Some(table) = self.bridges.lock().unwrap().get_mut(bridge) {
            table.remove(&ofport);
        }
    }

    pub fn table(&self, bridge: &str) -> Option<PortTable> {
        self.bridges.lock().unwrap().get(bridge).cloned()
    }

    pub fn has_bridge(&self, bridge: &str) -> bool {
        self.bridges.lock().unwrap().contains_key(bridge)
    }

    fn attach(&self, bridge: &str, port: &str, ofport: Option<u32>) -> u32 {
        let mut bridges = self.bridges.lock().unwrap();
        let table = bridges.entry(bridge.to_string()).or_default();
        let ofport = ofport.unwrap_or_else(|| lowest_free_port(table));
        table.insert(ofport, port.to_string());
        ofport
    }

    fn detach(&self, bridge: &str, port: &str) -> bool {
        let mut bridges = self.bridges.lock().unwrap();
        bridges.get_mut(bridge).is_some_and(|table| {
            let before = table.len();
            table.retain(|_, name| name != port);
            table.len() != before
        })
    }
}

#[async_trait]
impl SwitchControl for MockSwitch {
    async fn ping(&self) -> DovesnapResult<()> {
        Ok(())
    }

    async fn bridge_exists(&self, bridge: &str) -> DovesnapResult<bool> {
        Ok(self.has_bridge(bridge))
    }

    async fn create_bridge(&self, spec: &BridgeSpec) -> DovesnapResult<()> {
        if *self.fail_create.lock().unwrap() {
            return Err(DovesnapError::config("bridge creation refused"));
        }
        *self.creates.lock().unwrap() += 1;
        self.bridges
            .lock()
            .unwrap()
            .entry(spec.name.clone())
            .or_default();
        for port in &spec.add_ports {
            self.attach(&spec.name, &port.name, port.ofport);
        }
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> DovesnapResult<()> {
        self.bridges
            .lock()
            .unwrap()
            .remove(bridge)
            .map(|_| ())
            .ok_or_else(|| missing("bridge"))
    }

    async fn add_internal_port(
        &self,
        bridge: &str,
        port: &str,
        ofport: Option<u32>,
        _vlan_tag: Option<u16>,
    ) -> DovesnapResult<u32> {
        if !self.has_bridge(bridge) {
            return Err(missing("bridge"));
        }
        Ok(self.attach(bridge, port, ofport))
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> DovesnapResult<()> {
        if self.detach(bridge, port) {
            Ok(())
        } else {
            Err(missing("port"))
        }
    }

    async fn add_patch_port(
        &self,
        bridge_a: &str,
        bridge_b: &str,
        ofport_a: Option<u32>,
        ofport_b: Option<u32>,
    ) -> DovesnapResult<(u32, u32)> {
        let a = self.attach(bridge_a, &patch_port_name(bridge_a, bridge_b), ofport_a);
        let b = self.attach(bridge_b, &patch_port_name(bridge_b, bridge_a), ofport_b);
        Ok((a, b))
    }

    async fn delete_patch_port(&self, bridge_a: &str, bridge_b: &str) -> DovesnapResult<()> {
        self.detach(bridge_a, &patch_port_name(bridge_a, bridge_b));
        self.detach(bridge_b, &patch_port_name(bridge_b, bridge_a));
        Ok(())
    }

    async fn port_table(&self, bridge: &str) -> DovesnapResult<PortTable> {
        self.table(bridge).ok_or_else(|| missing("bridge"))
    }

    async fn port_number(&self, port: &str) -> DovesnapResult<u32> {
        self.bridges
            .lock()
            .unwrap()
            .values()
            .flat_map(|table| table.iter())
            .find(|(_, name)| name.as_str() == port)
            .map(|(ofport, _)| *ofport)
            .ok_or_else(|| missing("port"))
    }

    async fn add_flow(&self, bridge: &str, flow: &str) -> DovesnapResult<()> {
        self.flows
            .lock()
            .unwrap()
            .push((bridge.to_string(), flow.to_string()));
        Ok(())
    }

    async fn del_flows(&self, bridge: &str) -> DovesnapResult<()> {
        self.flows.lock().unwrap().retain(|(b, _)| b != bridge);
        Ok(())
    }
}

/// Host plumbing that only records what it was asked to do.
#[derive(Default)]
pub struct MockHost {
    pub calls: Mutex<Vec<String>>,
}

impl MockHost {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|call| call.starts_with(prefix))
    }
}

#[async_trait]
impl HostNetwork for MockHost {
    async fn create_veth(&self, pair: &VethPair, mtu: u32) -> DovesnapResult<()> {
        self.record(format!("create_veth {} {mtu}", pair.host));
        Ok(())
    }

    async fn delete_veth(&self, pair: &VethPair) {
        self.record(format!("delete_veth {}", pair.host));
    }

    async fn link_netns(&self, _pid: i64, name: &str) -> DovesnapResult<PathBuf> {
        self.record(format!("link_netns {name}"));
        Ok(PathBuf::from("/run/netns").join(name))
    }

    async fn unlink_netns(&self, link: &Path) -> DovesnapResult<()> {
        self.record(format!("unlink_netns {}", link.display()));
        Ok(())
    }

    async fn start_dhcp(&self, name: &str) -> DovesnapResult<DhcpClient> {
        self.record(format!("start_dhcp {name}"));
        Ok(DhcpClient::detached(name))
    }

    async fn set_container_mac(
        &self,
        name: &str,
        current_mac: &str,
        new_mac: &str,
    ) -> DovesnapResult<()> {
        self.record(format!("set_container_mac {name} {current_mac} {new_mac}"));
        Ok(())
    }

    async fn setup_nat(&self, bridge: &str, gateway: &str, mask: &str) -> DovesnapResult<()> {
        self.record(format!("setup_nat {bridge} {gateway}/{mask}"));
        Ok(())
    }

    async fn teardown_nat(&self, gateway: &str, mask: &str) -> DovesnapResult<()> {
        self.record(format!("teardown_nat {gateway}/{mask}"));
        Ok(())
    }

    async fn add_port_mapping(
        &self,
        _mapper: &PortMapper,
        mapping: &PortMapping,
    ) -> DovesnapResult<()> {
        self.record(format!(
            "add_port_mapping {}->{}:{}",
            mapping.host_port, mapping.container_ip, mapping.container_port
        ));
        Ok(())
    }

    async fn remove_port_mapping(&self, _mapper: &PortMapper, mapping: &PortMapping) {
        self.record(format!(
            "remove_port_mapping {}->{}:{}",
            mapping.host_port, mapping.container_ip, mapping.container_port
        ));
    }
}

/// One controller RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaucetCall {
    SetConfig(FaucetDoc),
    DeleteDp(String),
    DeleteDpInterfaces(String, Vec<u32>),
    AddPortMirror(String, u32, u32),
    RemovePortMirror(String, u32, u32),
    SetRemoteMirror(RemoteMirror),
}

/// Controller that records every RPC.
#[derive(Default)]
pub struct MockFaucet {
    pub calls: Mutex<Vec<FaucetCall>>,
    pub refuse_config: Mutex<bool>,
}

impl MockFaucet {
    fn record(&self, call: FaucetCall) -> DovesnapResult<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    pub fn calls(&self) -> Vec<FaucetCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Every document pushed, merged in order.
    pub fn merged(&self) -> FaucetDoc {
        let mut merged = FaucetDoc::new();
        for call in self.calls() {
            if let FaucetCall::SetConfig(doc) = call {
                merged.merge(doc);
            }
        }
        merged
    }
}

#[async_trait]
impl FaucetConfig for MockFaucet {
    async fn set_config(&self, doc: &FaucetDoc) -> DovesnapResult<()> {
        if *self.refuse_config.lock().unwrap() {
            return Err(DovesnapError::Controller {
                message: "config refused".into(),
            });
        }
        self.record(FaucetCall::SetConfig(doc.clone()))
    }

    async fn delete_dp(&self, dp_name: &str) -> DovesnapResult<()> {
        self.record(FaucetCall::DeleteDp(dp_name.to_string()))
    }

    async fn delete_dp_interfaces(&self, dp_name: &str, ports: &[u32]) -> DovesnapResult<()> {
        self.record(FaucetCall::DeleteDpInterfaces(dp_name.to_string(), ports.to_vec()))
    }

    async fn add_port_mirror(
        &self,
        dp_name: &str,
        port: u32,
        mirror_port: u32,
    ) -> DovesnapResult<()> {
        self.record(FaucetCall::AddPortMirror(dp_name.to_string(), port, mirror_port))
    }

    async fn remove_port_mirror(
        &self,
        dp_name: &str,
        port: u32,
        mirror_port: u32,
    ) -> DovesnapResult<()> {
        self.record(FaucetCall::RemovePortMirror(dp_name.to_string(), port, mirror_port))
    }

    async fn set_remote_mirror_port(&self, mirror: &RemoteMirror) -> DovesnapResult<()> {
        self.record(FaucetCall::SetRemoteMirror(mirror.clone()))
    }
}

/// Runtime whose networks and containers are registered by the test.
#[derive(Default)]
pub struct MockRuntime {
    pub networks: Mutex<BTreeMap<String, NetworkResource>>,
    pub containers: Mutex<HashMap<String, ContainerInfo>>,
}

impl MockRuntime {
    pub fn add_network(&self, id: &str, name: &str, options: &[(&str, &str)]) {
        self.networks.lock().unwrap().insert(
            id.to_string(),
            NetworkResource {
                id: id.to_string(),
                name: name.to_string(),
                driver: DRIVER_NAME.to_string(),
                options: options
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                ..NetworkResource::default()
            },
        );
    }

    /// Attach a container to a registered network through `endpoint_id`.
    pub fn add_container(
        &self,
        network_id: &str,
        endpoint_id: &str,
        container: ContainerInfo,
        ipv4_address: Option<&str>,
    ) {
        if let Some(network) = self.networks.lock().unwrap().get_mut(network_id) {
            network.containers.insert(
                container.id.clone(),
                NetworkEndpoint {
                    endpoint_id: endpoint_id.to_string(),
                    mac_address: Some("02:42:ac:11:00:02".into()),
                    ipv4_address: ipv4_address.map(String::from),
                },
            );
        }
        self.containers
            .lock()
            .unwrap()
            .insert(container.id.clone(), container);
    }
}

#[async_trait]
impl RuntimeInspector for MockRuntime {
    async fn engine_id(&self) -> DovesnapResult<String> {
        Ok("ABCD:EFGH".into())
    }

    async fn list_networks(&self) -> DovesnapResult<Vec<NetworkResource>> {
        Ok(self
            .networks
            .lock()
            .unwrap()
            .values()
            .map(|network| NetworkResource {
                containers: BTreeMap::new(),
                ..network.clone()
            })
            .collect())
    }

    async fn inspect_network(&self, id: &str) -> DovesnapResult<NetworkResource> {
        self.networks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| DovesnapError::NetworkNotFound { id: id.to_string() })
    }

    async fn inspect_container(&self, id: &str) -> DovesnapResult<ContainerInfo> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| DovesnapError::EndpointNotFound { id: id.to_string() })
    }
}

/// The four fakes wired into one set of adapters.
#[derive(Clone, Default)]
pub struct Fakes {
    pub switch: Arc<MockSwitch>,
    pub host: Arc<MockHost>,
    pub faucet: Arc<MockFaucet>,
    pub runtime: Arc<MockRuntime>,
}

impl Fakes {
    pub fn adapters(&self) -> Adapters {
        Adapters {
            switch: self.switch.clone(),
            host: self.host.clone(),
            faucet: self.faucet.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

/// Settings that never wait on the runtime.
pub fn settings() -> DriverSettings {
    DriverSettings::default().with_runtime_retry(RetryPolicy::ONCE)
}

/// Start a manager over `fakes` and return its handle.
pub fn start(fakes: &Fakes, settings: DriverSettings) -> ManagerHandle {
    let (manager, handle) = ResourceManager::new(fakes.adapters(), Arc::new(settings), None);
    tokio::spawn(manager.run());
    handle
}

/// Options of a network with the given driver options.
pub fn options(network_id: &str, pairs: &[(&str, &str)]) -> DovesnapResult<NetworkOptions> {
    let map = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    NetworkOptions::parse(network_id, &map, false, None)
}

/// A container with a name, an id and labels.
pub fn container(id: &str, name: &str, labels: &[(&str, &str)]) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: name.to_string(),
        pid: 4242,
        labels: labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        ..ContainerInfo::default()
    }
}

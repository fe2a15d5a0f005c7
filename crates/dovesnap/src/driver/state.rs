//! Topology state owned by the resource manager.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;

use serde::Serialize;

use crate::config::DriverSettings;
use crate::driver::options::NetworkOptions;

/// A container attached to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerState {
    /// Container name.
    pub name: String,
    /// Runtime container id.
    pub id: String,
    /// Switch port number.
    pub ofport: u32,
    /// MAC address, after any prefix rewrite.
    pub mac_address: Option<String>,
    /// IPv4 address.
    pub host_ip: Option<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

/// A non-container port on a network's bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalPortState {
    /// Interface name.
    pub name: String,
    /// Switch port number.
    pub ofport: u32,
}

/// One network as the manager believes it to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkState {
    /// Options the network was created with.
    #[serde(flatten)]
    pub options: NetworkOptions,
    /// Runtime network name, also the controller datapath name.
    pub network_name: String,
    /// Datapath id in decimal.
    pub dp_id: u64,
    /// Controllers programmed on the bridge.
    pub controllers: Vec<String>,
    /// Attached containers by endpoint id.
    pub containers: BTreeMap<String, ContainerState>,
    /// Other ports by interface name.
    pub external_ports: BTreeMap<String, ExternalPortState>,
}

impl NetworkState {
    /// Fresh state for `options`, taking the driver's default controllers
    /// when the network names none.
    #[must_use]
    pub fn new(options: NetworkOptions, settings: &DriverSettings) -> Self {
        let controllers = if options.controllers.is_empty() {
            settings.default_controllers.clone()
        } else {
            options.controllers.clone()
        };
        Self {
            dp_id: options.dpid.as_u64(),
            options,
            network_name: String::new(),
            controllers,
            containers: BTreeMap::new(),
            external_ports: BTreeMap::new(),
        }
    }

    /// Set the runtime name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.network_name = name.into();
        self
    }

    /// Record a non-container port.
    pub fn add_external_port(&mut self, name: impl Into<String>, ofport: u32) {
        let name = name.into();
        self.external_ports
            .insert(name.clone(), ExternalPortState { name, ofport });
    }
}

impl Deref for NetworkState {
    type Target = NetworkOptions;

    fn deref(&self) -> &NetworkOptions {
        &self.options
    }
}

/// Per-network mirroring parameters.
///
/// Only the loopback port is set unless remote mirroring over the stack is
/// configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackMirrorConfig {
    /// Local mirror/loopback port number.
    pub lb_port: u32,
    /// VLAN the mirrored traffic is tunneled on.
    pub tunnel_vid: u32,
    /// Datapath owning the collector port.
    pub remote_dp_name: String,
    /// Collector port.
    pub remote_mirror_port: u32,
}

impl StackMirrorConfig {
    /// Mirroring parameters of a network.
    #[must_use]
    pub fn for_network(options: &NetworkOptions, settings: &DriverSettings) -> Self {
        match &settings.stack_mirror_interface {
            Some(collector) if settings.using_stack_mirroring() => Self {
                lb_port: options.lb_port,
                tunnel_vid: options.tunnel_vid(),
                remote_dp_name: collector.dp.clone(),
                remote_mirror_port: collector.port,
            },
            _ => Self {
                lb_port: options.lb_port,
                ..Self::default()
            },
        }
    }
}

/// One network in a [`TopologySnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSnapshot {
    /// The network.
    #[serde(flatten)]
    pub state: NetworkState,
    /// Its mirroring parameters.
    pub stack_mirror: StackMirrorConfig,
}

/// A copy of everything the manager knows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologySnapshot {
    /// Networks ordered by id.
    pub networks: Vec<NetworkSnapshot>,
}

impl TopologySnapshot {
    /// Look up a network by id.
    #[must_use]
    pub fn network(&self, network_id: &str) -> Option<&NetworkSnapshot> {
        self.networks
            .iter()
            .find(|network| network.state.network_id == network_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::options::OPT_DPID;

    fn options() -> NetworkOptions {
        let raw = [(OPT_DPID.to_string(), "0x10".to_string())]
            .into_iter()
            .collect();
        NetworkOptions::parse("abcdef123456", &raw, false, None).unwrap()
    }

    #[test]
    fn default_controllers_fill_in() {
        let settings = DriverSettings::default().with_default_controllers("tcp:127.0.0.1:6653");
        let state = NetworkState::new(options(), &settings).with_name("net1");
        assert_eq!(state.controllers, vec!["tcp:127.0.0.1:6653".to_string()]);
        assert_eq!(state.dp_id, 16);
        assert_eq!(state.bridge_name, "ovsbr-abcde");
        assert_eq!(state.network_name, "net1");
    }

    #[test]
    fn mirror_config_without_stack_mirroring_is_zero() {
        let config = StackMirrorConfig::for_network(&options(), &DriverSettings::default());
        assert_eq!(config.lb_port, 99);
        assert_eq!(config.tunnel_vid, 0);
        assert_eq!(config.remote_mirror_port, 0);
        assert!(config.remote_dp_name.is_empty());

        let only_mirror = DriverSettings::default()
            .with_stack_mirror_interface("sw1:3")
            .unwrap();
        let config = StackMirrorConfig::for_network(&options(), &only_mirror);
        assert_eq!(config.tunnel_vid, 0);
    }

    #[test]
    fn mirror_config_with_stack_mirroring() {
        let settings = DriverSettings::default()
            .with_stacking_interfaces("sw1:7:enp1s0")
            .unwrap()
            .with_stack_mirror_interface("sw1:3")
            .unwrap();
        let config = StackMirrorConfig::for_network(&options(), &settings);
        assert_eq!(config.tunnel_vid, 356);
        assert_eq!(config.remote_dp_name, "sw1");
        assert_eq!(config.remote_mirror_port, 3);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let mut state = NetworkState::new(options(), &DriverSettings::default()).with_name("net1");
        state.add_external_port("enp1s0", 3);
        let snapshot = TopologySnapshot {
            networks: vec![NetworkSnapshot {
                state,
                stack_mirror: StackMirrorConfig::default(),
            }],
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        let net = &json["networks"][0];
        assert_eq!(net["network_name"], "net1");
        assert_eq!(net["dpid"], "0x10");
        assert_eq!(net["dp_id"], 16);
        assert_eq!(net["mode"], "flat");
        assert_eq!(net["external_ports"]["enp1s0"]["ofport"], 3);
        assert!(snapshot.network("abcdef123456").is_some());
    }
}

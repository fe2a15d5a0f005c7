//! Per-network options.
//!
//! Options arrive as `ovs.bridge.*` strings, either in a create request or
//! stored on an existing runtime network. Both go through
//! [`NetworkOptions::parse`], so a network recovered after a restart is
//! derived exactly as it was at creation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use dovesnap_common::{DatapathId, DovesnapError, DovesnapResult, truncate_id};
use dovesnap_network::AddPort;
use dovesnap_network::switch::BRIDGE_PREFIX;

use crate::config::parse_bool;
use crate::docker::NetworkResource;

/// Bridge name override.
pub const OPT_BRIDGE_NAME: &str = "ovs.bridge.name";
/// MTU of container links.
pub const OPT_MTU: &str = "ovs.bridge.mtu";
/// Native VLAN of every port.
pub const OPT_VLAN: &str = "ovs.bridge.vlan";
/// `flat` or `nat`.
pub const OPT_MODE: &str = "ovs.bridge.mode";
/// Static ports, `name[/ofport],...`.
pub const OPT_ADD_PORTS: &str = "ovs.bridge.add_ports";
/// OpenFlow controllers, comma separated.
pub const OPT_CONTROLLER: &str = "ovs.bridge.controller";
/// Datapath id in hex.
pub const OPT_DPID: &str = "ovs.bridge.dpid";
/// Host interface bridged in flat mode.
pub const OPT_BIND_INTERFACE: &str = "ovs.bridge.bind_interface";
/// Run a DHCP client in joined containers.
pub const OPT_DHCP: &str = "ovs.bridge.dhcp";
/// Use the userspace datapath.
pub const OPT_USERSPACE: &str = "ovs.bridge.userspace";
/// Port number of the mirror/loopback port.
pub const OPT_LB_PORT: &str = "ovs.bridge.lbport";
/// VLAN mirrored traffic is tunneled on.
pub const OPT_MIRROR_TUNNEL_VID: &str = "ovs.bridge.mirror_tunnel_vid";
/// ACL applied to the NAT port.
pub const OPT_NAT_ACL: &str = "ovs.bridge.nat_acl";
/// MAC of the bridge LOCAL port.
pub const OPT_OVS_LOCAL_MAC: &str = "ovs.bridge.ovs_local_mac";

/// Default MTU.
pub const DEFAULT_MTU: u32 = 1500;
/// Default VLAN.
pub const DEFAULT_VLAN: u16 = 100;
/// Default mirror/loopback port number.
pub const DEFAULT_LB_PORT: u32 = 99;
/// Offset of the default mirror tunnel VLAN over the network VLAN.
pub const TUNNEL_VLAN_OFFSET: u32 = 256;

/// How traffic leaves the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Layer 2 only; the controller decides everything.
    #[default]
    Flat,
    /// The host routes and masquerades for the network.
    Nat,
}

impl FromStr for BridgeMode {
    type Err = DovesnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "flat" => Ok(Self::Flat),
            "nat" => Ok(Self::Nat),
            other => Err(DovesnapError::invalid_option(
                OPT_MODE,
                other,
                "expected flat or nat",
            )),
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flat => "flat",
            Self::Nat => "nat",
        })
    }
}

/// Gateway address and prefix length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gateway {
    /// Address without prefix.
    pub address: String,
    /// Prefix length.
    pub mask: String,
}

impl Gateway {
    /// Parse `address/mask`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the value has exactly one `/` with both
    /// sides non-empty.
    pub fn parse_cidr(cidr: &str) -> DovesnapResult<Self> {
        match cidr.split_once('/') {
            Some((address, mask)) if !address.is_empty() && !mask.is_empty() && !mask.contains('/') => {
                Ok(Self {
                    address: address.to_string(),
                    mask: mask.to_string(),
                })
            }
            _ => Err(DovesnapError::invalid_option(
                "gateway",
                cidr,
                "expected address/prefix",
            )),
        }
    }

    /// `address/mask`
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.mask)
    }
}

/// Everything a network's options determine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkOptions {
    /// Runtime network id.
    pub network_id: String,
    /// Bridge name.
    pub bridge_name: String,
    /// MTU of container links.
    pub mtu: u32,
    /// Native VLAN.
    pub vlan: u16,
    /// Forwarding mode.
    pub mode: BridgeMode,
    /// Static ports.
    pub add_ports: Vec<AddPort>,
    /// Controllers named by the network; empty means the driver default.
    pub controllers: Vec<String>,
    /// Datapath id.
    pub dpid: DatapathId,
    /// Host interface bridged in flat mode.
    pub bind_interface: Option<String>,
    /// DHCP in containers.
    pub dhcp: bool,
    /// Userspace datapath.
    pub userspace: bool,
    /// Mirror/loopback port number.
    pub lb_port: u32,
    /// Explicit mirror tunnel VLAN.
    pub mirror_tunnel_vid: Option<u32>,
    /// ACL of the NAT port.
    pub nat_acl: Option<String>,
    /// Bridge LOCAL port MAC.
    pub ovs_local_mac: Option<String>,
    /// Network gateway.
    pub gateway: Option<Gateway>,
    /// Created as an internal network.
    pub internal: bool,
}

fn text<'a>(options: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    options
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn number<T: FromStr>(options: &HashMap<String, String>, key: &str, default: T) -> DovesnapResult<T> {
    text(options, key).map_or(Ok(default), |value| {
        value
            .parse()
            .map_err(|_| DovesnapError::invalid_option(key, value, "expected a number"))
    })
}

fn flag(options: &HashMap<String, String>, key: &str) -> DovesnapResult<bool> {
    text(options, key).map_or(Ok(false), |value| {
        parse_bool(value)
            .ok_or_else(|| DovesnapError::invalid_option(key, value, "expected a boolean"))
    })
}

impl NetworkOptions {
    /// Derive and validate a network's options.
    ///
    /// # Errors
    ///
    /// Returns [`DovesnapError::InvalidOption`] for an unknown mode, a
    /// missing or malformed datapath id, malformed numbers, or DHCP on a
    /// network that is not flat, internal and without a gateway.
    pub fn parse(
        network_id: &str,
        options: &HashMap<String, String>,
        internal: bool,
        gateway: Option<Gateway>,
    ) -> DovesnapResult<Self> {
        let mode: BridgeMode = text(options, OPT_MODE).unwrap_or_default().parse()?;
        let dpid: DatapathId = text(options, OPT_DPID)
            .ok_or_else(|| DovesnapError::invalid_option(OPT_DPID, "", "a datapath id is required"))?
            .parse()?;
        let vlan: u16 = number(options, OPT_VLAN, DEFAULT_VLAN)?;
        if !(1..=4094).contains(&vlan) {
            return Err(DovesnapError::invalid_option(
                OPT_VLAN,
                vlan.to_string(),
                "VLAN must be between 1 and 4094",
            ));
        }

        let parsed = Self {
            network_id: network_id.to_string(),
            bridge_name: text(options, OPT_BRIDGE_NAME).map_or_else(
                || format!("{BRIDGE_PREFIX}{}", truncate_id(network_id)),
                String::from,
            ),
            mtu: number(options, OPT_MTU, DEFAULT_MTU)?,
            vlan,
            mode,
            add_ports: AddPort::parse_list(text(options, OPT_ADD_PORTS).unwrap_or_default())?,
            controllers: crate::config::split_list(text(options, OPT_CONTROLLER).unwrap_or_default()),
            dpid,
            bind_interface: text(options, OPT_BIND_INTERFACE).map(String::from),
            dhcp: flag(options, OPT_DHCP)?,
            userspace: flag(options, OPT_USERSPACE)?,
            lb_port: number(options, OPT_LB_PORT, DEFAULT_LB_PORT)?,
            mirror_tunnel_vid: text(options, OPT_MIRROR_TUNNEL_VID)
                .map(|_| number(options, OPT_MIRROR_TUNNEL_VID, 0))
                .transpose()?,
            nat_acl: text(options, OPT_NAT_ACL).map(String::from),
            ovs_local_mac: text(options, OPT_OVS_LOCAL_MAC).map(String::from),
            gateway,
            internal,
        };
        parsed.validate_dhcp()?;
        Ok(parsed)
    }

    fn validate_dhcp(&self) -> DovesnapResult<()> {
        if !self.dhcp {
            return Ok(());
        }
        let reason = if self.mode != BridgeMode::Flat {
            "DHCP requires flat mode"
        } else if self.gateway.is_some() {
            "DHCP networks must not have an IPAM gateway"
        } else if !self.internal {
            "DHCP networks must be internal"
        } else {
            return Ok(());
        };
        Err(DovesnapError::invalid_option(OPT_DHCP, "true", reason))
    }

    /// Options of a network stored by the runtime.
    ///
    /// The gateway is taken from the first IPAM pool, with the prefix
    /// length of its subnet.
    ///
    /// # Errors
    ///
    /// As [`NetworkOptions::parse`].
    pub fn from_resource(resource: &NetworkResource) -> DovesnapResult<Self> {
        let gateway = resource.ipam.first().and_then(|pool| {
            let address = pool.gateway.as_deref().filter(|gw| !gw.is_empty())?;
            let (_, mask) = pool.subnet.as_deref()?.split_once('/')?;
            Some(Gateway {
                address: address.to_string(),
                mask: mask.to_string(),
            })
        });
        Self::parse(&resource.id, &resource.options, resource.internal, gateway)
    }

    /// Default mirror tunnel VLAN unless set explicitly.
    #[must_use]
    pub fn tunnel_vid(&self) -> u32 {
        self.mirror_tunnel_vid
            .unwrap_or_else(|| u32::from(self.vlan) + TUNNEL_VLAN_OFFSET)
    }

    /// Names of every statically attached host interface.
    pub fn static_port_names(&self) -> impl Iterator<Item = &str> {
        self.add_ports
            .iter()
            .map(|port| port.name.as_str())
            .chain(self.bind_interface.as_deref())
    }

    /// Static ports to program on the bridge: add-ports, plus the bind
    /// interface in flat mode.
    #[must_use]
    pub fn bridge_ports(&self) -> Vec<AddPort> {
        let mut ports = self.add_ports.clone();
        if self.mode == BridgeMode::Flat {
            if let Some(bind) = &self.bind_interface {
                if !ports.iter().any(|port| &port.name == bind) {
                    ports.push(AddPort {
                        name: bind.clone(),
                        ofport: None,
                    });
                }
            }
        }
        ports
    }
}

//! Switch control surface and port naming.
//!
//! [`SwitchControl`] is everything the driver asks of the virtual switch:
//! bridge lifecycle, port allocation, cross-bridge patch links, flow
//! programming and port table introspection. [`crate::OvsSwitch`] implements
//! it over the Open vSwitch command line tools.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dovesnap_common::{DatapathId, DovesnapError, DovesnapResult};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Host port name prefix of a container's veth pair.
pub const CONTAINER_PORT_PREFIX: &str = "ovs-veth0-";
/// Peer (container side) name prefix of a container's veth pair.
pub const CONTAINER_PEER_PREFIX: &str = "ethc";
/// Interface prefix the runtime uses when renaming the peer inside the container.
pub const CONTAINER_ETH_PREFIX: &str = "eth";
/// Name prefix of both ends of a patch link.
pub const PATCH_PREFIX: &str = "ovp";
/// Prefix of generated bridge names.
pub const BRIDGE_PREFIX: &str = "ovsbr-";
/// Host-level mirror bridge.
pub const MIRROR_BRIDGE: &str = "mirrorbr";
/// OpenFlow port number of a bridge's LOCAL port.
pub const OFPP_LOCAL: u32 = 4_294_967_294;
/// Host interface name length limit.
pub const MAX_IFNAME_LEN: usize = 15;

const B62_ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const B62_U32_WIDTH: usize = 6;

/// Live port table of one bridge: OpenFlow port number to port name.
pub type PortTable = BTreeMap<u32, String>;

/// A statically configured bridge port, `name` or `name/ofport`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddPort {
    /// Host interface name.
    pub name: String,
    /// Requested OpenFlow port number.
    pub ofport: Option<u32>,
}

impl AddPort {
    /// Parse a comma separated add-ports list. Empty entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a requested port number is not a positive integer.
    pub fn parse_list(list: &str) -> DovesnapResult<Vec<Self>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once('/') {
                Some((name, number)) => {
                    let ofport = number
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            DovesnapError::invalid_option(
                                "ovs.bridge.add_ports",
                                entry,
                                "port number must be a positive integer",
                            )
                        })?;
                    Ok(Self {
                        name: name.to_string(),
                        ofport: Some(ofport),
                    })
                }
                None => Ok(Self {
                    name: entry.to_string(),
                    ofport: None,
                }),
            })
            .collect()
    }
}

/// Everything needed to program a bridge.
#[derive(Debug, Clone, Default)]
pub struct BridgeSpec {
    /// Bridge name.
    pub name: String,
    /// OpenFlow controller targets (e.g. `tcp:127.0.0.1:6653`).
    pub controllers: Vec<String>,
    /// Datapath id.
    pub dpid: Option<DatapathId>,
    /// Static ports.
    pub add_ports: Vec<AddPort>,
    /// Succeed if the bridge already exists.
    pub may_exist: bool,
    /// Use the userspace (netdev) datapath.
    pub userspace: bool,
    /// MAC address for the bridge LOCAL port.
    pub local_mac: Option<String>,
}

impl BridgeSpec {
    /// A bridge with nothing configured beyond its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Control surface of the virtual switch.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Check that the switch answers at all.
    async fn ping(&self) -> DovesnapResult<()>;

    /// Whether `bridge` exists.
    async fn bridge_exists(&self, bridge: &str) -> DovesnapResult<bool>;

    /// Create and program a bridge. On failure the bridge is deleted again.
    async fn create_bridge(&self, spec: &BridgeSpec) -> DovesnapResult<()>;

    /// Delete a bridge and all its ports.
    async fn delete_bridge(&self, bridge: &str) -> DovesnapResult<()>;

    /// Attach an existing host interface to `bridge`. Without an explicit
    /// `ofport` the lowest free port number in the live table is requested.
    /// Returns the port number the switch assigned.
    async fn add_internal_port(
        &self,
        bridge: &str,
        port: &str,
        ofport: Option<u32>,
        vlan_tag: Option<u16>,
    ) -> DovesnapResult<u32>;

    /// Detach a port from `bridge`.
    async fn delete_port(&self, bridge: &str, port: &str) -> DovesnapResult<()>;

    /// Link two bridges with a veth pair. Returns the port numbers on
    /// `bridge_a` and `bridge_b`.
    async fn add_patch_port(
        &self,
        bridge_a: &str,
        bridge_b: &str,
        ofport_a: Option<u32>,
        ofport_b: Option<u32>,
    ) -> DovesnapResult<(u32, u32)>;

    /// Remove the link created by [`SwitchControl::add_patch_port`].
    async fn delete_patch_port(&self, bridge_a: &str, bridge_b: &str) -> DovesnapResult<()>;

    /// Scrape the live port table of `bridge`.
    async fn port_table(&self, bridge: &str) -> DovesnapResult<PortTable>;

    /// OpenFlow port number of an interface.
    async fn port_number(&self, port: &str) -> DovesnapResult<u32>;

    /// Install one flow.
    async fn add_flow(&self, bridge: &str, flow: &str) -> DovesnapResult<()>;

    /// Remove all flows.
    async fn del_flows(&self, bridge: &str) -> DovesnapResult<()>;
}

/// Smallest positive port number absent from `table`.
#[must_use]
pub fn lowest_free_port(table: &PortTable) -> u32 {
    let mut candidate = 1;
    for &port in table.keys() {
        if port == candidate {
            candidate += 1;
        } else if port > candidate {
            break;
        }
    }
    candidate
}

/// Parse `ovs-ofctl dump-ports-desc` output into a port table.
///
/// Only numbered ports are returned; `LOCAL` is skipped.
#[must_use]
pub fn parse_ports_desc(output: &str) -> PortTable {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (number, rest) = line.split_once('(')?;
            if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let (name, rest) = rest.split_once(')')?;
            if name.is_empty() || name.contains(char::is_whitespace) || !rest.starts_with(':') {
                return None;
            }
            Some((number.parse().ok()?, name.to_string()))
        })
        .collect()
}

fn base62(mut n: u32) -> String {
    let mut digits = [b'0'; B62_U32_WIDTH];
    for slot in digits.iter_mut().rev() {
        *slot = B62_ALPHABET[(n % 62) as usize];
        n /= 62;
    }
    String::from_utf8_lossy(&digits).into_owned()
}

fn short_hash(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    base62(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

/// Name of the `bridge_a` end of the patch link between two bridges.
///
/// The `bridge_b` end is `patch_port_name(bridge_b, bridge_a)`. Names are
/// always [`MAX_IFNAME_LEN`] characters. Distinct pairs can collide.
#[must_use]
pub fn patch_port_name(bridge_a: &str, bridge_b: &str) -> String {
    format!("{PATCH_PREFIX}{}{}", short_hash(bridge_a), short_hash(bridge_b))
}

/// Whether a port name belongs to a container veth or a patch link.
#[must_use]
pub fn is_managed_port(name: &str) -> bool {
    name.starts_with(CONTAINER_PORT_PREFIX) || name.starts_with(PATCH_PREFIX)
}

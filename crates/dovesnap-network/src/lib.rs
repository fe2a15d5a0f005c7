//! # dovesnap-network
//!
//! Open vSwitch control and host network plumbing for dovesnap.
//!
//! Switch operations go through the [`SwitchControl`] trait and host
//! operations through [`HostNetwork`], so the driver core can be exercised
//! without a switch or root privileges.

#![warn(missing_docs)]

mod command;
pub mod dhcp;
pub mod host;
pub mod nat;
pub mod netns;
pub mod ovs;
pub mod portmap;
pub mod switch;
pub mod veth;

pub use dhcp::DhcpClient;
pub use host::{HostNetwork, LinuxHost, apply_mac_prefix};
pub use ovs::{OvsSwitch, wait_for_switch};
pub use portmap::{PortMapper, PortMapping, Protocol};
pub use switch::{AddPort, BridgeSpec, PortTable, SwitchControl, patch_port_name};
pub use veth::VethPair;

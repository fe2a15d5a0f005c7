//! Host-side plumbing around the switch.
//!
//! [`HostNetwork`] covers what the driver does to the host outside Open
//! vSwitch: veth pairs, namespace links, DHCP clients, container MAC
//! rewrites, NAT and published ports. [`LinuxHost`] implements it with the
//! `ip` and `iptables` tools.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dovesnap_common::{DovesnapError, DovesnapPaths, DovesnapResult};

use crate::command::run_host;
use crate::dhcp::DhcpClient;
use crate::portmap::{PortMapper, PortMapping};
use crate::veth::VethPair;
use crate::{nat, netns};

/// Host network operations used by the resource manager.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Create a veth pair with both ends up.
    async fn create_veth(&self, pair: &VethPair, mtu: u32) -> DovesnapResult<()>;

    /// Delete a veth pair, logging failures.
    async fn delete_veth(&self, pair: &VethPair);

    /// Expose a process's network namespace under `name`.
    async fn link_netns(&self, pid: i64, name: &str) -> DovesnapResult<PathBuf>;

    /// Remove a namespace link.
    async fn unlink_netns(&self, link: &Path) -> DovesnapResult<()>;

    /// Start a DHCP client in the namespace `name`.
    async fn start_dhcp(&self, name: &str) -> DovesnapResult<DhcpClient>;

    /// Change the MAC of the interface inside namespace `name` that
    /// currently has `current_mac`.
    async fn set_container_mac(
        &self,
        name: &str,
        current_mac: &str,
        new_mac: &str,
    ) -> DovesnapResult<()>;

    /// Give the bridge its gateway address and masquerade the subnet.
    async fn setup_nat(&self, bridge: &str, gateway: &str, mask: &str) -> DovesnapResult<()>;

    /// Undo [`HostNetwork::setup_nat`].
    async fn teardown_nat(&self, gateway: &str, mask: &str) -> DovesnapResult<()>;

    /// Forward a published host port to a container.
    async fn add_port_mapping(
        &self,
        mapper: &PortMapper,
        mapping: &PortMapping,
    ) -> DovesnapResult<()>;

    /// Remove a forward, logging failures.
    async fn remove_port_mapping(&self, mapper: &PortMapper, mapping: &PortMapping);
}

/// [`HostNetwork`] for a Linux host.
#[derive(Debug, Clone, Default)]
pub struct LinuxHost {
    paths: DovesnapPaths,
}

impl LinuxHost {
    /// Create a host adapter linking namespaces under `paths.netns`.
    #[must_use]
    pub const fn new(paths: DovesnapPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl HostNetwork for LinuxHost {
    async fn create_veth(&self, pair: &VethPair, mtu: u32) -> DovesnapResult<()> {
        pair.create(mtu).await
    }

    async fn delete_veth(&self, pair: &VethPair) {
        pair.delete().await;
    }

    async fn link_netns(&self, pid: i64, name: &str) -> DovesnapResult<PathBuf> {
        netns::link_netns(&self.paths, pid, name)
    }

    async fn unlink_netns(&self, link: &Path) -> DovesnapResult<()> {
        netns::unlink_netns(link)
    }

    async fn start_dhcp(&self, name: &str) -> DovesnapResult<DhcpClient> {
        DhcpClient::spawn(name)
    }

    async fn set_container_mac(
        &self,
        name: &str,
        current_mac: &str,
        new_mac: &str,
    ) -> DovesnapResult<()> {
        let links = run_host("ip", &["netns", "exec", name, "ip", "-o", "link", "show"]).await?;
        let iface = interface_with_mac(&links, current_mac).ok_or_else(|| DovesnapError::Host {
            message: format!("No interface with MAC {current_mac} in {name}"),
        })?;
        tracing::info!(netns = name, %iface, from = current_mac, to = new_mac, "Rewriting MAC");
        run_host(
            "ip",
            &[
                "netns", "exec", name, "ip", "link", "set", "dev", iface.as_str(), "address",
                new_mac,
            ],
        )
        .await?;
        Ok(())
    }

    async fn setup_nat(&self, bridge: &str, gateway: &str, mask: &str) -> DovesnapResult<()> {
        nat::setup_nat(bridge, gateway, mask).await
    }

    async fn teardown_nat(&self, gateway: &str, mask: &str) -> DovesnapResult<()> {
        nat::teardown_nat(gateway, mask).await
    }

    async fn add_port_mapping(
        &self,
        mapper: &PortMapper,
        mapping: &PortMapping,
    ) -> DovesnapResult<()> {
        mapper.add(mapping).await
    }

    async fn remove_port_mapping(&self, mapper: &PortMapper, mapping: &PortMapping) {
        mapper.remove(mapping).await;
    }
}

fn parse_octets(s: &str) -> Option<Vec<u8>> {
    s.split(':')
        .map(|octet| {
            if octet.is_empty() || octet.len() > 2 {
                None
            } else {
                u8::from_str_radix(octet, 16).ok()
            }
        })
        .collect()
}

/// Replace the leading octets of `mac` with `prefix` (e.g. `0e:00`).
///
/// # Errors
///
/// Returns an error if either value is not colon separated hex, or the
/// prefix is longer than five octets.
pub fn apply_mac_prefix(prefix: &str, mac: &str) -> DovesnapResult<String> {
    let invalid = |reason: &str| {
        DovesnapError::invalid_option("dovesnap.faucet.mac_prefix", prefix, reason)
    };
    let prefix_octets = parse_octets(prefix).ok_or_else(|| invalid("not a MAC prefix"))?;
    if prefix_octets.len() >= 6 {
        return Err(invalid("prefix must be shorter than a MAC address"));
    }
    let mut octets = parse_octets(mac)
        .filter(|o| o.len() == 6)
        .ok_or_else(|| invalid("container MAC is not a MAC address"))?;
    octets[..prefix_octets.len()].copy_from_slice(&prefix_octets);
    Ok(octets
        .iter()
        .map(|o| format!("{o:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Find the interface that has `mac` in `ip -o link show` output.
#[must_use]
pub fn interface_with_mac(ip_link_output: &str, mac: &str) -> Option<String> {
    let mac = mac.to_ascii_lowercase();
    ip_link_output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        let name = words.nth(1)?;
        let has_mac = line
            .split_whitespace()
            .collect::<Vec<_>>()
            .windows(2)
            .any(|w| w[0] == "link/ether" && w[1].eq_ignore_ascii_case(&mac));
        has_mac.then(|| {
            name.trim_end_matches(':')
                .split('@')
                .next()
                .unwrap_or_default()
                .to_string()
        })
    })
}

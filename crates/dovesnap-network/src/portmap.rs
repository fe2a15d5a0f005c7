//! Published port forwarding for containers on NAT networks.
//!
//! Each mapping becomes three iptables NAT rules: a PREROUTING DNAT for
//! traffic arriving from outside the network's bridge, an OUTPUT DNAT for
//! host-local traffic and a POSTROUTING MASQUERADE for hairpin return
//! traffic. Rules carry a comment naming the endpoint.

use serde::{Deserialize, Serialize};

use dovesnap_common::DovesnapResult;

use crate::command::run_host;

/// Protocol for port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string for iptables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Map an IP protocol number (6, 17) as the runtime reports it.
    #[must_use]
    pub const fn from_ip_proto(proto: u8) -> Option<Self> {
        match proto {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port mapping between host and container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port.
    pub host_port: u16,
    /// Container port.
    pub container_port: u16,
    /// Container IP address.
    pub container_ip: String,
    /// Protocol (TCP or UDP).
    pub protocol: Protocol,
    /// Host IP to bind to (optional, defaults to any).
    pub host_ip: Option<String>,
}

impl PortMapping {
    /// Create a new TCP port mapping.
    #[must_use]
    pub fn tcp(host_port: u16, container_port: u16, container_ip: &str) -> Self {
        Self {
            host_port,
            container_port,
            container_ip: container_ip.to_string(),
            protocol: Protocol::Tcp,
            host_ip: None,
        }
    }

    /// Create a new UDP port mapping.
    #[must_use]
    pub fn udp(host_port: u16, container_port: u16, container_ip: &str) -> Self {
        Self {
            protocol: Protocol::Udp,
            ..Self::tcp(host_port, container_port, container_ip)
        }
    }

    /// Set the host IP to bind to.
    #[must_use]
    pub fn with_host_ip(mut self, ip: &str) -> Self {
        self.host_ip = Some(ip.to_string());
        self
    }
}

/// Whether a rule set is being appended or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// `-A`
    Append,
    /// `-D`
    Delete,
}

impl RuleAction {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// Builds and applies the iptables rules of an endpoint's published ports.
#[derive(Debug, Clone)]
pub struct PortMapper {
    bridge: String,
    comment: String,
}

impl PortMapper {
    /// Rules for `endpoint_id` on the network bridged by `bridge`.
    #[must_use]
    pub fn new(bridge: &str, endpoint_id: &str) -> Self {
        Self {
            bridge: bridge.to_string(),
            comment: format!("dovesnap-{endpoint_id}"),
        }
    }

    /// iptables argument lists for one mapping.
    #[must_use]
    pub fn rules(&self, mapping: &PortMapping, action: RuleAction) -> Vec<Vec<String>> {
        let host_port = mapping.host_port.to_string();
        let container_port = mapping.container_port.to_string();
        let dest = format!("{}:{}", mapping.container_ip, mapping.container_port);
        let proto = mapping.protocol.as_str();
        let tail = |args: &mut Vec<String>| {
            args.extend(
                ["-m", "comment", "--comment", self.comment.as_str()]
                    .iter()
                    .map(ToString::to_string),
            );
        };

        let mut prerouting: Vec<String> = ["-t", "nat", action.flag(), "PREROUTING"]
            .iter()
            .map(ToString::to_string)
            .collect();
        if let Some(host_ip) = &mapping.host_ip {
            prerouting.extend(["-d".to_string(), host_ip.clone()]);
        }
        prerouting.extend(
            [
                "!",
                "-i",
                self.bridge.as_str(),
                "-p",
                proto,
                "--dport",
                host_port.as_str(),
                "-j",
                "DNAT",
                "--to-destination",
                dest.as_str(),
            ]
            .iter()
            .map(ToString::to_string),
        );
        tail(&mut prerouting);

        let mut output: Vec<String> = [
            "-t",
            "nat",
            action.flag(),
            "OUTPUT",
            "-p",
            proto,
            "-d",
            "127.0.0.1",
            "--dport",
            host_port.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            dest.as_str(),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        tail(&mut output);

        let mut masquerade: Vec<String> = [
            "-t",
            "nat",
            action.flag(),
            "POSTROUTING",
            "-p",
            proto,
            "-d",
            mapping.container_ip.as_str(),
            "--dport",
            container_port.as_str(),
            "-j",
            "MASQUERADE",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        tail(&mut masquerade);

        vec![prerouting, output, masquerade]
    }

    /// Install the rules for `mapping`.
    pub async fn add(&self, mapping: &PortMapping) -> DovesnapResult<()> {
        tracing::debug!(
            host_port = mapping.host_port,
            container_port = mapping.container_port,
            container_ip = %mapping.container_ip,
            protocol = %mapping.protocol,
            "Adding port mapping"
        );
        for rule in self.rules(mapping, RuleAction::Append) {
            run_host("iptables", rule.as_slice()).await?;
        }
        Ok(())
    }

    /// Remove the rules for `mapping`. Every rule is attempted.
    pub async fn remove(&self, mapping: &PortMapping) {
        tracing::debug!(
            host_port = mapping.host_port,
            container_port = mapping.container_port,
            "Removing port mapping"
        );
        for rule in self.rules(mapping, RuleAction::Delete) {
            if let Err(e) = run_host("iptables", rule.as_slice()).await {
                tracing::warn!(error = %e, "Failed to remove port mapping rule");
            }
        }
    }
}

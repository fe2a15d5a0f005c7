//! Faucet configuration documents.
//!
//! A [`FaucetDoc`] is a typed, partial Faucet `dps:` tree. The driver builds
//! one per topology change, scoped to the datapaths and interfaces being
//! touched, and the controller's config service merges it into the running
//! configuration. Fields left as `None` are omitted from the YAML so a merge
//! never clobbers what it does not mention.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use dovesnap_common::{DovesnapError, DovesnapResult};

/// A partial Faucet configuration: datapath name to datapath.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaucetDoc {
    /// Datapaths by name.
    pub dps: BTreeMap<String, DpDoc>,
}

/// One datapath.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpDoc {
    /// Integer datapath id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp_id: Option<u64>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hardware type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    /// Stack root priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackPriority>,
    /// Interfaces by OpenFlow port number.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interfaces: BTreeMap<u32, InterfaceDoc>,
}

/// `stack: {priority: N}` on a datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackPriority {
    /// Lower is preferred as stack root.
    pub priority: u32,
}

/// One interface of a datapath.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDoc {
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Untagged VLAN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_vlan: Option<u16>,
    /// Ingress ACL names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acls_in: Option<Vec<String>>,
    /// Peer of a stack link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackLink>,
    /// Port only outputs (mirror destinations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_only: Option<bool>,
}

/// `stack: {dp, port}` on an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackLink {
    /// Remote datapath name.
    pub dp: String,
    /// Remote port number.
    pub port: u32,
}

/// An access port on `vlan`. An empty ACL list is omitted.
#[must_use]
pub fn vlan_interface(description: impl Into<String>, vlan: u16, acls: Vec<String>) -> InterfaceDoc {
    InterfaceDoc {
        description: Some(description.into()),
        native_vlan: Some(vlan),
        acls_in: (!acls.is_empty()).then_some(acls),
        ..InterfaceDoc::default()
    }
}

/// A stack link to `remote_port` on `remote_dp`.
#[must_use]
pub fn stack_interface(remote_dp: &str, remote_port: u32) -> InterfaceDoc {
    InterfaceDoc {
        description: Some(format!("Stack link to {remote_dp}")),
        stack: Some(StackLink {
            dp: remote_dp.to_string(),
            port: remote_port,
        }),
        ..InterfaceDoc::default()
    }
}

/// The output-only port traffic is mirrored to.
#[must_use]
pub fn mirror_interface() -> InterfaceDoc {
    InterfaceDoc {
        description: Some("mirror".into()),
        output_only: Some(true),
        ..InterfaceDoc::default()
    }
}

/// Split a comma separated ACL list, dropping empty names.
#[must_use]
pub fn parse_acls(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|acl| !acl.is_empty())
        .map(String::from)
        .collect()
}

impl DpDoc {
    fn merge(&mut self, other: Self) {
        if other.dp_id.is_some() {
            self.dp_id = other.dp_id;
        }
        if other.description.is_some() {
            self.description = other.description;
        }
        if other.hardware.is_some() {
            self.hardware = other.hardware;
        }
        if other.stack.is_some() {
            self.stack = other.stack;
        }
        self.interfaces.extend(other.interfaces);
    }
}

impl FaucetDoc {
    /// An empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A network bridge datapath with the given interfaces.
    #[must_use]
    pub fn bridge(
        dp_name: &str,
        dp_id: u64,
        bridge: &str,
        interfaces: impl IntoIterator<Item = (u32, InterfaceDoc)>,
    ) -> Self {
        let mut doc = Self::new();
        doc.dps.insert(
            dp_name.to_string(),
            DpDoc {
                dp_id: Some(dp_id),
                description: Some(format!("OVS Bridge {bridge}")),
                interfaces: interfaces.into_iter().collect(),
                ..DpDoc::default()
            },
        );
        doc
    }

    /// Add or replace interfaces of `dp_name` without touching its other keys.
    pub fn add_interfaces(
        &mut self,
        dp_name: &str,
        interfaces: impl IntoIterator<Item = (u32, InterfaceDoc)>,
    ) -> &mut Self {
        self.dps
            .entry(dp_name.to_string())
            .or_default()
            .interfaces
            .extend(interfaces);
        self
    }

    /// Insert or merge a whole datapath.
    pub fn add_dp(&mut self, dp_name: &str, dp: DpDoc) -> &mut Self {
        self.dps.entry(dp_name.to_string()).or_default().merge(dp);
        self
    }

    /// Merge `other` into this document. Keys set in `other` win.
    pub fn merge(&mut self, other: Self) -> &mut Self {
        for (name, dp) in other.dps {
            self.add_dp(&name, dp);
        }
        self
    }

    /// Whether the document mentions nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dps.is_empty()
    }

    /// Interfaces declared for `dp_name`.
    #[must_use]
    pub fn interfaces(&self, dp_name: &str) -> Option<&BTreeMap<u32, InterfaceDoc>> {
        self.dps.get(dp_name).map(|dp| &dp.interfaces)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> DovesnapResult<String> {
        serde_yaml::to_string(self).map_err(|e| DovesnapError::Serialization(e.to_string()))
    }

    /// Parse YAML.
    pub fn from_yaml(yaml: &str) -> DovesnapResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| DovesnapError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_document_yaml() {
        let doc = FaucetDoc::bridge(
            "net1",
            1,
            "ovsbr-abcde",
            [(3, vlan_interface("web abcde", 100, vec!["allow".into()]))],
        );
        let parsed: serde_yaml::Value = serde_yaml::from_str(&doc.to_yaml().unwrap()).unwrap();
        let dp = &parsed["dps"]["net1"];
        assert_eq!(dp["dp_id"].as_u64(), Some(1));
        assert_eq!(dp["description"].as_str(), Some("OVS Bridge ovsbr-abcde"));
        let port = &dp["interfaces"][3];
        assert_eq!(port["native_vlan"].as_u64(), Some(100));
        assert_eq!(port["acls_in"][0].as_str(), Some("allow"));
        assert!(port.get("stack").is_none());
    }

    #[test]
    fn unset_keys_are_omitted() {
        let mut doc = FaucetDoc::new();
        doc.add_interfaces("stackdp", [(7, stack_interface("net1", 2))]);
        let yaml = doc.to_yaml().unwrap();
        assert!(!yaml.contains("dp_id"));
        assert!(!yaml.contains("native_vlan"));
        assert!(yaml.contains("Stack link to net1"));
    }

    #[test]
    fn empty_acl_list_is_omitted() {
        let port = vlan_interface("c1", 100, parse_acls(""));
        assert_eq!(port.acls_in, None);
        assert_eq!(parse_acls("a, b,,"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn merge_keeps_unrelated_interfaces() {
        let mut doc = FaucetDoc::bridge("net1", 1, "br", [(1, vlan_interface("a", 100, vec![]))]);
        let mut other = FaucetDoc::new();
        other
            .add_interfaces("net1", [(2, mirror_interface())])
            .add_interfaces("stackdp", [(5, stack_interface("net1", 2))]);
        doc.merge(other);

        let net1 = &doc.dps["net1"];
        assert_eq!(net1.dp_id, Some(1));
        assert_eq!(net1.interfaces.len(), 2);
        assert_eq!(net1.interfaces[&2].output_only, Some(true));
        assert_eq!(doc.interfaces("stackdp").map(BTreeMap::len), Some(1));
    }

    #[test]
    fn yaml_round_trip() {
        let mut doc = FaucetDoc::bridge("net1", 0x0E0F_00AB_CDEF, "br", Vec::new());
        doc.add_dp(
            "remote",
            DpDoc {
                stack: Some(StackPriority { priority: 1 }),
                ..DpDoc::default()
            },
        );
        let back = FaucetDoc::from_yaml(&doc.to_yaml().unwrap()).unwrap();
        assert_eq!(back, doc);
    }
}

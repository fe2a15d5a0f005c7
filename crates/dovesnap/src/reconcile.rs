//! Drift repair between bridges and the controller configuration.
//!
//! Ports can appear on or vanish from a bridge behind the driver's back
//! (`ovs-vsctl add-port`, hot-plugged NICs). The reconciler periodically
//! scrapes every bridge's port table, diffs it against the table it saw
//! last time, and pushes or deletes the matching controller interfaces.
//! It reads topology through a query and never changes manager state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use dovesnap_common::{DovesnapError, DovesnapResult};
use dovesnap_faucet::{FaucetConfig, FaucetDoc, vlan_interface};
use dovesnap_network::switch::{OFPP_LOCAL, is_managed_port};
use dovesnap_network::{PortTable, SwitchControl};

use crate::driver::{ManagerHandle, NetworkSnapshot};

/// Ports of a network that the reconciler must leave alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    /// Mirror/loopback port number.
    pub lb_port: u32,
    /// Statically configured interface names.
    pub static_ports: BTreeSet<String>,
}

impl PortFilter {
    /// Filter for a network.
    #[must_use]
    pub fn for_network(network: &NetworkSnapshot) -> Self {
        Self {
            lb_port: network.stack_mirror.lb_port,
            static_ports: network
                .state
                .static_port_names()
                .map(String::from)
                .collect(),
        }
    }

    fn ignores_added(&self, ofport: u32, name: &str) -> bool {
        ofport == OFPP_LOCAL
            || ofport == self.lb_port
            || is_managed_port(name)
            || self.static_ports.contains(name)
    }
}

/// Difference between two observations of a bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDrift {
    /// Unmanaged ports that disappeared.
    pub removed: Vec<u32>,
    /// Unmanaged ports that appeared, with their names.
    pub added: Vec<(u32, String)>,
}

impl PortDrift {
    /// Nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Compare the previous observation of a bridge with the current one.
///
/// Without a previous observation every eligible port counts as added.
#[must_use]
pub fn diff_ports(previous: Option<&PortTable>, observed: &PortTable, filter: &PortFilter) -> PortDrift {
    let removed = previous
        .into_iter()
        .flatten()
        .filter(|(ofport, name)| !observed.contains_key(*ofport) && !is_managed_port(name))
        .map(|(ofport, _)| *ofport)
        .collect();
    let added = observed
        .iter()
        .filter(|(ofport, _)| previous.is_none_or(|previous| !previous.contains_key(*ofport)))
        .filter(|(ofport, name)| !filter.ignores_added(**ofport, name))
        .map(|(ofport, name)| (*ofport, name.clone()))
        .collect();
    PortDrift { removed, added }
}

/// The periodic reconciliation task.
pub struct Reconciler {
    manager: ManagerHandle,
    switch: Arc<dyn SwitchControl>,
    faucet: Arc<dyn FaucetConfig>,
    interval: Duration,
    observed: HashMap<String, PortTable>,
}

impl Reconciler {
    /// Create a reconciler polling every `interval`.
    #[must_use]
    pub fn new(
        manager: ManagerHandle,
        switch: Arc<dyn SwitchControl>,
        faucet: Arc<dyn FaucetConfig>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            switch,
            faucet,
            interval,
            observed: HashMap::new(),
        }
    }

    /// One pass over every known network.
    ///
    /// A network whose port table cannot be scraped is skipped this pass.
    ///
    /// # Errors
    ///
    /// Returns [`DovesnapError::QueueClosed`] once the manager has stopped,
    /// or the first controller error.
    pub async fn reconcile_once(&mut self) -> DovesnapResult<()> {
        let snapshot = self.manager.query().await?;
        self.observed
            .retain(|id, _| snapshot.network(id).is_some());

        for network in &snapshot.networks {
            let state = &network.state;
            if state.network_name.is_empty() {
                continue;
            }
            let observed = match self.switch.port_table(&state.bridge_name).await {
                Ok(table) => table,
                Err(e) => {
                    tracing::debug!(bridge = %state.bridge_name, error = %e, "Cannot scrape ports");
                    continue;
                }
            };
            let previous = self.observed.get(&state.network_id);
            if previous == Some(&observed) {
                continue;
            }
            let drift = diff_ports(previous, &observed, &PortFilter::for_network(network));

            for ofport in &drift.removed {
                tracing::info!(
                    network = %state.network_name,
                    bridge = %state.bridge_name,
                    ofport,
                    "Removing unmanaged port"
                );
            }
            if !drift.removed.is_empty() {
                self.faucet
                    .delete_dp_interfaces(&state.network_name, &drift.removed)
                    .await?;
            }

            if !drift.added.is_empty() {
                let interfaces = drift.added.iter().map(|(ofport, name)| {
                    tracing::info!(
                        network = %state.network_name,
                        bridge = %state.bridge_name,
                        ofport,
                        port = %name,
                        "Adding unmanaged port"
                    );
                    (
                        *ofport,
                        vlan_interface(format!("Physical interface {name}"), state.vlan, Vec::new()),
                    )
                });
                let doc = FaucetDoc::bridge(&state.network_name, state.dp_id, &state.bridge_name, interfaces);
                self.faucet.set_config(&doc).await?;
            }

            self.observed.insert(state.network_id.clone(), observed);
        }
        Ok(())
    }

    /// Reconcile forever, until the manager stops.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.reconcile_once().await {
                Ok(()) => {}
                Err(DovesnapError::QueueClosed) => break,
                Err(e) => tracing::warn!(error = %e, "Reconciliation pass failed"),
            }
        }
        tracing::debug!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(ports: &[(u32, &str)]) -> PortTable {
        ports.iter().map(|(n, s)| (*n, (*s).to_string())).collect()
    }

    #[test]
    fn new_physical_port_is_added() {
        let previous = table(&[(1, "ovs-veth0-x")]);
        let observed = table(&[(1, "ovs-veth0-x"), (5, "eth3")]);
        let drift = diff_ports(Some(&previous), &observed, &PortFilter::default());
        assert_eq!(drift.added, vec![(5, "eth3".to_string())]);
        assert!(drift.removed.is_empty());
    }

    #[test]
    fn vanished_physical_port_is_removed() {
        let previous = table(&[(5, "eth3")]);
        let drift = diff_ports(Some(&previous), &PortTable::new(), &PortFilter::default());
        assert_eq!(drift.removed, vec![5]);
        assert!(drift.added.is_empty());
    }

    #[test]
    fn managed_and_static_ports_are_ignored() {
        let filter = PortFilter {
            lb_port: 99,
            static_ports: ["enp1s0".to_string()].into_iter().collect(),
        };
        let observed = table(&[
            (1, "enp1s0"),
            (2, "ovs-veth0-abcde"),
            (3, "ovp000001000002"),
            (99, "mirror"),
            (OFPP_LOCAL, "ovsbr-abcde"),
            (7, "eth7"),
        ]);
        let drift = diff_ports(None, &observed, &filter);
        assert_eq!(drift.added, vec![(7, "eth7".to_string())]);

        let gone = diff_ports(Some(&observed), &PortTable::new(), &filter);
        assert_eq!(gone.removed, vec![1, 7, 99, OFPP_LOCAL]);
    }

    #[test]
    fn unchanged_table_has_no_drift() {
        let observed = table(&[(1, "eth1"), (2, "ovs-veth0-x")]);
        assert!(diff_ports(Some(&observed), &observed, &PortFilter::default()).is_empty());
    }

    proptest! {
        #[test]
        fn drift_only_names_changed_ports(
            before in proptest::collection::btree_map(1u32..32, "eth[0-9]", 0..12),
            after in proptest::collection::btree_map(1u32..32, "eth[0-9]", 0..12),
        ) {
            let drift = diff_ports(Some(&before), &after, &PortFilter::default());
            for ofport in &drift.removed {
                prop_assert!(before.contains_key(ofport) && !after.contains_key(ofport));
            }
            for (ofport, _) in &drift.added {
                prop_assert!(after.contains_key(ofport) && !before.contains_key(ofport));
            }
        }
    }
}

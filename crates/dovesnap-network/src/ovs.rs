//! Open vSwitch implementation of [`SwitchControl`].

use std::time::Duration;

use async_trait::async_trait;
use dovesnap_common::{DovesnapError, DovesnapPaths, DovesnapResult};

use crate::command::{self, run_host};
use crate::switch::{
    BridgeSpec, PortTable, SwitchControl, lowest_free_port, parse_ports_desc, patch_port_name,
};

/// Drives Open vSwitch through `ovs-vsctl` and `ovs-ofctl`.
#[derive(Debug, Clone)]
pub struct OvsSwitch {
    paths: DovesnapPaths,
}

impl Default for OvsSwitch {
    fn default() -> Self {
        Self::new(DovesnapPaths::default())
    }
}

impl OvsSwitch {
    /// Create a switch adapter using the given tool paths.
    #[must_use]
    pub const fn new(paths: DovesnapPaths) -> Self {
        Self { paths }
    }

    async fn vsctl<S: AsRef<str>>(&self, args: &[S]) -> DovesnapResult<String> {
        let mut all = vec![self.paths.ovs_db_arg()];
        all.extend(args.iter().map(|a| a.as_ref().to_string()));
        command::run(&self.paths.ovs_vsctl, &all)
            .await
            .map_err(command::Failed::into_switch)
    }

    async fn ofctl<S: AsRef<str>>(&self, args: &[S]) -> DovesnapResult<String> {
        let all: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        command::run(&self.paths.ovs_ofctl, &all)
            .await
            .map_err(command::Failed::into_switch)
    }

    async fn program_bridge(&self, spec: &BridgeSpec) -> DovesnapResult<()> {
        let name = spec.name.as_str();
        let mut commands: Vec<Vec<String>> = Vec::new();

        if spec.userspace {
            commands.push(vec![
                "set".into(),
                "bridge".into(),
                name.into(),
                "datapath_type=netdev".into(),
            ]);
        }
        if let Some(dpid) = spec.dpid {
            commands.push(vec![
                "set".into(),
                "bridge".into(),
                name.into(),
                format!("other-config:datapath-id={}", dpid.to_ovs_hex()),
            ]);
        }
        if let Some(mac) = &spec.local_mac {
            commands.push(vec![
                "set".into(),
                "bridge".into(),
                name.into(),
                format!("other-config:hwaddr={mac}"),
            ]);
        }
        if !spec.controllers.is_empty() {
            commands.push(vec![
                "set".into(),
                "bridge".into(),
                name.into(),
                "fail-mode=secure".into(),
            ]);
            let mut set_controller = vec!["set-controller".to_string(), name.to_string()];
            set_controller.extend(spec.controllers.iter().cloned());
            commands.push(set_controller);
        }
        for port in &spec.add_ports {
            let mut add = vec!["add-port".to_string(), name.into(), port.name.clone()];
            if let Some(ofport) = port.ofport {
                add.extend([
                    "--".into(),
                    "set".into(),
                    "Interface".into(),
                    port.name.clone(),
                    format!("ofport_request={ofport}"),
                ]);
            }
            commands.push(add);
        }

        for cmd in &commands {
            self.vsctl(cmd.as_slice()).await?;
        }
        run_host("ip", &["link", "set", name, "up"]).await?;
        Ok(())
    }
}

#[async_trait]
impl SwitchControl for OvsSwitch {
    async fn ping(&self) -> DovesnapResult<()> {
        self.vsctl(&["show"]).await.map(|_| ())
    }

    async fn bridge_exists(&self, bridge: &str) -> DovesnapResult<bool> {
        // br-exists exits 2 for a missing bridge.
        match self.vsctl(&["br-exists", bridge]).await {
            Ok(_) => Ok(true),
            Err(DovesnapError::Switch { output, .. }) if output.is_empty() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bridge(&self, spec: &BridgeSpec) -> DovesnapResult<()> {
        let name = spec.name.as_str();
        tracing::debug!(bridge = name, "Creating bridge");

        let mut add = Vec::with_capacity(8);
        if spec.may_exist {
            add.push("--may-exist");
        }
        add.extend(["add-br", name, "--", "set", "Bridge", name, "stp_enable=false"]);
        if let Err(e) = self.vsctl(add.as_slice()).await {
            tracing::error!(bridge = name, error = %e, "Error creating bridge");
            return Err(e);
        }

        if let Err(e) = self.program_bridge(spec).await {
            tracing::warn!(bridge = name, error = %e, "Bridge configuration failed, deleting bridge");
            if let Err(del) = self.vsctl(&["del-br", name]).await {
                tracing::warn!(bridge = name, error = %del, "Failed to delete partial bridge");
            }
            return Err(e);
        }

        tracing::info!(bridge = name, "Bridge created");
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> DovesnapResult<()> {
        tracing::debug!(bridge, "Deleting bridge");
        self.vsctl(&["del-br", bridge]).await.map(|_| ())
    }

    async fn add_internal_port(
        &self,
        bridge: &str,
        port: &str,
        ofport: Option<u32>,
        vlan_tag: Option<u16>,
    ) -> DovesnapResult<u32> {
        let requested = match ofport {
            Some(n) => n,
            None => lowest_free_port(&self.port_table(bridge).await?),
        };

        let mut args = vec!["add-port".to_string(), bridge.into(), port.into()];
        if let Some(tag) = vlan_tag {
            args.push(format!("tag={tag}"));
        }
        args.extend([
            "--".into(),
            "set".into(),
            "Interface".into(),
            port.into(),
            format!("ofport_request={requested}"),
        ]);
        self.vsctl(args.as_slice()).await?;

        let assigned = self.port_number(port).await?;
        tracing::debug!(bridge, port, requested, assigned, "Port added");
        Ok(assigned)
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> DovesnapResult<()> {
        self.vsctl(&["del-port", bridge, port]).await.map(|_| ())
    }

    async fn add_patch_port(
        &self,
        bridge_a: &str,
        bridge_b: &str,
        ofport_a: Option<u32>,
        ofport_b: Option<u32>,
    ) -> DovesnapResult<(u32, u32)> {
        let name_a = patch_port_name(bridge_a, bridge_b);
        let name_b = patch_port_name(bridge_b, bridge_a);
        tracing::debug!(bridge_a, bridge_b, %name_a, %name_b, "Adding patch link");

        run_host(
            "ip",
            &["link", "add", name_a.as_str(), "type", "veth", "peer", "name", name_b.as_str()],
        )
        .await?;

        let linked = async {
            run_host("ip", &["link", "set", name_a.as_str(), "up"]).await?;
            run_host("ip", &["link", "set", name_b.as_str(), "up"]).await?;
            let port_a = self
                .add_internal_port(bridge_a, &name_a, ofport_a, None)
                .await?;
            let port_b = self
                .add_internal_port(bridge_b, &name_b, ofport_b, None)
                .await?;
            Ok::<_, DovesnapError>((port_a, port_b))
        }
        .await;

        if linked.is_err() {
            if let Err(e) = self
                .vsctl(&["--if-exists", "del-port", bridge_a, name_a.as_str()])
                .await
            {
                tracing::warn!(bridge = bridge_a, port = %name_a, error = %e, "Cannot remove patch port");
            }
            if let Err(e) = run_host("ip", &["link", "delete", name_a.as_str()]).await {
                tracing::warn!(port = %name_a, error = %e, "Cannot remove patch link");
            }
        }
        linked
    }

    async fn delete_patch_port(&self, bridge_a: &str, bridge_b: &str) -> DovesnapResult<()> {
        let name_a = patch_port_name(bridge_a, bridge_b);
        let name_b = patch_port_name(bridge_b, bridge_a);
        self.vsctl(&["--if-exists", "del-port", bridge_a, name_a.as_str()])
            .await?;
        self.vsctl(&["--if-exists", "del-port", bridge_b, name_b.as_str()])
            .await?;
        run_host("ip", &["link", "delete", name_a.as_str()]).await?;
        Ok(())
    }

    async fn port_table(&self, bridge: &str) -> DovesnapResult<PortTable> {
        let output = self.ofctl(&["dump-ports-desc", bridge]).await?;
        Ok(parse_ports_desc(&output))
    }

    async fn port_number(&self, port: &str) -> DovesnapResult<u32> {
        let output = self.vsctl(&["get", "Interface", port, "ofport"]).await?;
        output
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| DovesnapError::Switch {
                command: format!("get Interface {port} ofport"),
                output,
            })
    }

    async fn add_flow(&self, bridge: &str, flow: &str) -> DovesnapResult<()> {
        self.ofctl(&["add-flow", bridge, flow]).await.map(|_| ())
    }

    async fn del_flows(&self, bridge: &str) -> DovesnapResult<()> {
        self.ofctl(&["del-flows", bridge]).await.map(|_| ())
    }
}

/// Wait for the switch to answer, polling up to `attempts` times.
///
/// # Errors
///
/// Returns the last error if the switch never answers.
pub async fn wait_for_switch(
    switch: &dyn SwitchControl,
    attempts: u32,
    delay: Duration,
) -> DovesnapResult<()> {
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match switch.ping().await {
            Ok(()) => {
                tracing::info!("Connected to open vswitch");
                return Ok(());
            }
            Err(e) => {
                tracing::info!(attempt, "Waiting for open vswitch");
                last = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(last.unwrap_or_else(|| DovesnapError::Internal {
        message: "switch wait made no attempts".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unreachable_switch() -> OvsSwitch {
        let mut paths = DovesnapPaths::new();
        paths.ovs_vsctl = PathBuf::from("/nonexistent/ovs-vsctl");
        paths.ovs_ofctl = PathBuf::from("/nonexistent/ovs-ofctl");
        OvsSwitch::new(paths)
    }

    #[tokio::test]
    async fn missing_tools_surface_as_switch_errors() {
        let switch = unreachable_switch();
        let err = switch.ping().await.unwrap_err();
        assert!(matches!(err, DovesnapError::Switch { .. }));
        assert!(switch.port_table("ovsbr-abcde").await.is_err());
    }

    #[tokio::test]
    async fn failed_patch_link_reports_the_error() {
        let switch = unreachable_switch();
        let result = switch
            .add_patch_port("ovsbr-abcde", "mirrorbr", Some(99), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up() {
        let switch = unreachable_switch();
        let result = wait_for_switch(&switch, 2, Duration::from_secs(5)).await;
        assert!(result.is_err());
    }
}

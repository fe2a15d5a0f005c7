//! Host-level bridges shared by every network.
//!
//! With stacking, each host runs one stacking bridge named after the
//! runtime engine, uplinked to remote datapaths; every network bridge is
//! patched into it. Stack mirroring adds a loopback bridge that reflects
//! mirrored traffic back into the stack. Without stacking, an optional
//! mirror bridge collects mirrored traffic of every network onto one
//! output interface.

use dovesnap_common::{DatapathId, DovesnapResult, short_engine_id};
use dovesnap_faucet::{DpDoc, FaucetConfig, FaucetDoc, StackPriority, stack_interface};
use dovesnap_network::switch::MIRROR_BRIDGE;
use dovesnap_network::{AddPort, BridgeSpec, SwitchControl};

use crate::config::DriverSettings;
use crate::docker::RuntimeInspector;

/// Port of the mirror bridge that all mirrored traffic leaves on.
pub const MIRROR_OUT_PORT: u32 = 1;

const STACK_DPID_PREFIX: &str = "0E0F00";

/// Names of this host's stacking and loopback bridges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackIdentity {
    engine: String,
    hostname: String,
}

impl StackIdentity {
    /// Identity from a runtime engine id and host name.
    #[must_use]
    pub fn new(engine_id: &str, hostname: impl Into<String>) -> Self {
        Self {
            engine: short_engine_id(engine_id),
            hostname: hostname.into(),
        }
    }

    /// Ask the runtime for its engine id and read the host name.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    pub async fn discover(runtime: &dyn RuntimeInspector) -> DovesnapResult<Self> {
        let engine_id = runtime.engine_id().await?;
        let hostname = match tokio::fs::read_to_string("/proc/sys/kernel/hostname").await {
            Ok(name) => name.trim().to_string(),
            Err(e) => {
                tracing::debug!(error = %e, "Cannot read host name");
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
            }
        };
        Ok(Self::new(&engine_id, hostname))
    }

    /// Stacking bridge and datapath name.
    #[must_use]
    pub fn dp_name(&self) -> String {
        format!("dovesnap{}", self.engine)
    }

    /// Stacking bridge datapath id.
    ///
    /// # Errors
    ///
    /// Never fails for identities built by [`StackIdentity::new`].
    pub fn dpid(&self) -> DovesnapResult<DatapathId> {
        format!("0x{STACK_DPID_PREFIX}{}", self.engine).parse()
    }

    /// Loopback bridge name.
    #[must_use]
    pub fn loopback_bridge(&self) -> String {
        format!("lb{}", self.engine)
    }

    /// Host name used in the stacking bridge description.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Controller document describing the stacking bridge and its uplinks.
///
/// `uplinks` pairs each configured stacking interface with the local port
/// it was given.
#[must_use]
pub fn stacking_document(
    settings: &DriverSettings,
    identity: &StackIdentity,
    dp_id: u64,
    uplinks: &[(u32, &crate::config::StackingInterface)],
) -> FaucetDoc {
    let dp_name = identity.dp_name();
    let mut doc = FaucetDoc::new();
    for (ofport, uplink) in uplinks {
        doc.add_dp(
            &uplink.remote_dp,
            DpDoc {
                stack: (settings.stack_priority1.as_deref() == Some(uplink.remote_dp.as_str()))
                    .then_some(StackPriority { priority: 1 }),
                interfaces: [(uplink.remote_port, stack_interface(&dp_name, *ofport))]
                    .into_iter()
                    .collect(),
                ..DpDoc::default()
            },
        );
    }
    doc.add_dp(
        &dp_name,
        DpDoc {
            dp_id: Some(dp_id),
            description: Some(format!("Dovesnap Stacking Bridge for {}", identity.hostname())),
            hardware: Some("Open vSwitch".into()),
            interfaces: uplinks
                .iter()
                .map(|(ofport, uplink)| {
                    (*ofport, stack_interface(&uplink.remote_dp, uplink.remote_port))
                })
                .collect(),
            ..DpDoc::default()
        },
    );
    doc
}

async fn create_stacking_bridge(
    settings: &DriverSettings,
    identity: &StackIdentity,
    switch: &dyn SwitchControl,
    faucet: &dyn FaucetConfig,
) -> DovesnapResult<()> {
    let dp_name = identity.dp_name();
    if switch.bridge_exists(&dp_name).await? {
        tracing::debug!(bridge = %dp_name, "Stacking bridge already exists");
        return Ok(());
    }
    tracing::info!(bridge = %dp_name, "Creating stacking bridge");
    let dpid = identity.dpid()?;
    switch
        .create_bridge(&BridgeSpec {
            controllers: settings.default_controllers.clone(),
            dpid: Some(dpid),
            may_exist: true,
            ..BridgeSpec::new(&dp_name)
        })
        .await?;

    let mut uplinks = Vec::with_capacity(settings.stacking_interfaces.len());
    for uplink in &settings.stacking_interfaces {
        let ofport = switch
            .add_internal_port(&dp_name, &uplink.local_interface, None, None)
            .await?;
        tracing::info!(
            bridge = %dp_name,
            interface = %uplink.local_interface,
            ofport,
            remote_dp = %uplink.remote_dp,
            "Attached stacking uplink"
        );
        uplinks.push((ofport, uplink));
    }
    faucet
        .set_config(&stacking_document(settings, identity, dpid.as_u64(), &uplinks))
        .await
}

async fn create_loopback_bridge(identity: &StackIdentity, switch: &dyn SwitchControl) -> DovesnapResult<()> {
    let bridge = identity.loopback_bridge();
    tracing::info!(%bridge, "Creating loopback bridge");
    switch
        .create_bridge(&BridgeSpec {
            may_exist: true,
            ..BridgeSpec::new(&bridge)
        })
        .await?;
    switch.del_flows(&bridge).await?;
    switch.add_flow(&bridge, "priority=0,actions=drop").await?;
    switch.add_flow(&bridge, "priority=1,actions=output:in_port").await
}

async fn create_mirror_bridge(settings: &DriverSettings, switch: &dyn SwitchControl) -> DovesnapResult<()> {
    if switch.bridge_exists(MIRROR_BRIDGE).await? {
        tracing::debug!(bridge = MIRROR_BRIDGE, "Mirror bridge already exists");
        return Ok(());
    }
    tracing::info!(bridge = MIRROR_BRIDGE, "Creating mirror bridge");
    let add_ports = settings
        .mirror_bridge_out
        .iter()
        .map(|name| AddPort {
            name: name.clone(),
            ofport: Some(MIRROR_OUT_PORT),
        })
        .chain(settings.mirror_bridge_in.iter().map(|name| AddPort {
            name: name.clone(),
            ofport: None,
        }))
        .collect();
    switch
        .create_bridge(&BridgeSpec {
            add_ports,
            may_exist: true,
            ..BridgeSpec::new(MIRROR_BRIDGE)
        })
        .await?;
    switch.del_flows(MIRROR_BRIDGE).await?;
    switch
        .add_flow(MIRROR_BRIDGE, "priority=0,actions=drop")
        .await?;
    switch
        .add_flow(
            MIRROR_BRIDGE,
            &format!("priority=1,actions=output:{MIRROR_OUT_PORT}"),
        )
        .await
}

/// Build the host-level bridges the settings call for.
///
/// # Errors
///
/// Returns the first switch or controller error; startup treats it as fatal.
pub async fn setup_host_bridges(
    settings: &DriverSettings,
    identity: Option<&StackIdentity>,
    switch: &dyn SwitchControl,
    faucet: &dyn FaucetConfig,
) -> DovesnapResult<()> {
    if settings.using_mirror_bridge() {
        create_mirror_bridge(settings, switch).await?;
    }
    match identity {
        Some(identity) if settings.using_stacking() => {
            create_stacking_bridge(settings, identity, switch, faucet).await?;
            if settings.using_stack_mirroring() {
                create_loopback_bridge(identity, switch).await?;
            }
        }
        _ => tracing::warn!("No stacking interface defined, not stacking datapaths"),
    }
    Ok(())
}

//! dovesnapd - Docker network plugin daemon.
//!
//! Serves the Docker network plugin protocol on a Unix socket and a small
//! HTTP status endpoint, and drives Open vSwitch bridges programmed by a
//! Faucet controller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dovesnap::docker::DockerInspector;
use dovesnap::driver::Adapters;
use dovesnap::reconcile::Reconciler;
use dovesnap::stack::{StackIdentity, setup_host_bridges};
use dovesnap::{DriverSettings, ResourceManager};
use dovesnap_common::{DovesnapResult, RetryPolicy};
use dovesnap_faucet::{FaucetConfClient, FaucetConnectConfig};
use dovesnap_network::netns::ensure_netns_dir;
use dovesnap_network::{LinuxHost, OvsSwitch, wait_for_switch};

mod api;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log at debug level unless RUST_LOG is set
    #[arg(long, env = "DOVESNAP_DEBUG")]
    debug: bool,

    /// faucetconfrpc server host name
    #[arg(long, env = "DOVESNAP_FAUCETCONFRPC_ADDR", default_value = "localhost")]
    faucetconfrpc_addr: String,

    /// faucetconfrpc server port
    #[arg(long, env = "DOVESNAP_FAUCETCONFRPC_PORT", default_value_t = 59999)]
    faucetconfrpc_port: u16,

    /// Directory with the faucetconfrpc client certificate, key and CA
    #[arg(long, env = "DOVESNAP_FAUCETCONFRPC_KEYDIR", default_value = "/faucetconfrpc")]
    faucetconfrpc_keydir: PathBuf,

    /// Base name of the faucetconfrpc client certificate
    #[arg(long, env = "DOVESNAP_FAUCETCONFRPC_CLIENT_NAME", default_value = "faucetconfrpc")]
    faucetconfrpc_client_name: String,

    /// Stacking uplinks as dp:port:interface,...
    #[arg(long, env = "DOVESNAP_STACKING_INTERFACES", default_value = "")]
    stacking_interfaces: String,

    /// Remote datapath given stack priority 1
    #[arg(long, env = "DOVESNAP_STACK_PRIORITY1")]
    stack_priority1: Option<String>,

    /// Remote mirror collector as dp:port
    #[arg(long, env = "DOVESNAP_STACK_MIRROR_INTERFACE", default_value = "")]
    stack_mirror_interface: String,

    /// OpenFlow controllers for bridges that name none, comma separated
    #[arg(long, env = "DOVESNAP_DEFAULT_OFCONTROLLERS", default_value = "")]
    default_ofcontrollers: String,

    /// Input interface of the mirror bridge
    #[arg(long, env = "DOVESNAP_MIRROR_BRIDGE_IN")]
    mirror_bridge_in: Option<String>,

    /// Output interface of the mirror bridge; enables the mirror bridge
    #[arg(long, env = "DOVESNAP_MIRROR_BRIDGE_OUT")]
    mirror_bridge_out: Option<String>,

    /// Status HTTP port, 0 disables it
    #[arg(long, env = "DOVESNAP_STATUS_PORT", default_value_t = 9401)]
    status_port: u16,

    /// Plugin socket Docker discovers the driver on
    #[arg(long, env = "DOVESNAP_PLUGIN_SOCKET", default_value = "/run/docker/plugins/ovs.sock")]
    plugin_socket: PathBuf,

    /// Seconds between reconciliation passes
    #[arg(long, env = "DOVESNAP_RECONCILE_INTERVAL_SECS", default_value_t = 3)]
    reconcile_interval_secs: u64,
}

impl Args {
    fn settings(&self) -> DovesnapResult<DriverSettings> {
        let mut settings = DriverSettings::default()
            .with_stacking_interfaces(&self.stacking_interfaces)?
            .with_stack_mirror_interface(&self.stack_mirror_interface)?
            .with_default_controllers(&self.default_ofcontrollers)
            .with_mirror_bridge(self.mirror_bridge_in.clone(), self.mirror_bridge_out.clone())
            .with_reconcile_interval(Duration::from_secs(self.reconcile_interval_secs));
        if let Some(dp) = &self.stack_priority1 {
            settings = settings.with_stack_priority1(dp.as_str());
        }
        settings.validate()?;
        Ok(settings)
    }

    fn faucet_config(&self) -> FaucetConnectConfig {
        FaucetConnectConfig {
            server: self.faucetconfrpc_addr.clone(),
            port: self.faucetconfrpc_port,
            keydir: self.faucetconfrpc_keydir.clone(),
            client_name: self.faucetconfrpc_client_name.clone(),
            ..FaucetConnectConfig::default()
        }
    }

    fn log_filter(&self) -> String {
        let level = if self.debug { "debug" } else { "info" };
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("dovesnap={level},dovesnapd={level}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(args.log_filter()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(args.settings().wrap_err("Invalid configuration")?);
    tracing::info!(
        stacking = settings.using_stacking(),
        mirror_bridge = settings.using_mirror_bridge(),
        stack_mirroring = settings.using_stack_mirroring(),
        "Starting dovesnapd"
    );

    let switch = Arc::new(OvsSwitch::new(settings.paths.clone()));
    wait_for_switch(
        switch.as_ref(),
        RetryPolicy::SWITCH_STARTUP.attempts,
        RetryPolicy::SWITCH_STARTUP.delay,
    )
    .await
    .wrap_err("Open vSwitch is not available")?;

    let faucet = Arc::new(
        FaucetConfClient::connect(&args.faucet_config())
            .await
            .wrap_err("Cannot connect to faucetconfrpc")?,
    );
    let runtime = Arc::new(DockerInspector::connect().wrap_err("Cannot connect to Docker")?);

    let identity = if settings.using_stacking() {
        Some(StackIdentity::discover(runtime.as_ref()).await?)
    } else {
        None
    };
    setup_host_bridges(&settings, identity.as_ref(), switch.as_ref(), faucet.as_ref())
        .await
        .wrap_err("Cannot create host bridges")?;

    ensure_netns_dir(&settings.paths.netns).wrap_err_with(|| format!("Cannot create {}", settings.paths.netns.display()))?;

    let adapters = Adapters {
        switch: switch.clone(),
        host: Arc::new(LinuxHost::new(settings.paths.clone())),
        faucet: faucet.clone(),
        runtime,
    };
    let (mut manager, handle) = ResourceManager::new(adapters, Arc::clone(&settings), identity);
    let restored = manager
        .rehydrate()
        .await
        .wrap_err("Cannot restore networks")?;
    tracing::info!(restored, "Restored existing networks");
    tokio::spawn(manager.run());

    let reconciler = Reconciler::new(
        handle.clone(),
        switch,
        faucet,
        settings.reconcile_interval,
    );
    tokio::spawn(reconciler.run());

    if args.status_port != 0 {
        let status = handle.clone();
        let port = args.status_port;
        tokio::spawn(async move {
            if let Err(e) = api::status::serve(port, status).await {
                tracing::error!(error = %e, "Status server exited");
            }
        });
    }

    tokio::select! {
        result = api::plugin::serve(&args.plugin_socket, handle) => {
            result.wrap_err("Plugin server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

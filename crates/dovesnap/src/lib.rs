//! # dovesnap
//!
//! Docker network driver core binding container networks to Open vSwitch
//! bridges managed by a Faucet controller.
//!
//! ## Layout
//!
//! - [`docker`]: read-only queries against the container runtime
//! - [`config`]: driver-wide settings (stacking, mirroring, intervals)
//! - [`driver`]: per-network options, topology state and the resource
//!   manager that serializes every lifecycle operation
//! - [`stack`]: host-level stacking, loopback and mirror bridges
//! - [`reconcile`]: periodic repair of drift between the switch and the
//!   controller configuration
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use dovesnap::config::DriverSettings;
//! use dovesnap::docker::DockerInspector;
//! use dovesnap::driver::{Adapters, ResourceManager};
//! use dovesnap_faucet::{FaucetConfClient, FaucetConnectConfig};
//! use dovesnap_network::{LinuxHost, OvsSwitch};
//!
//! # async fn example() -> dovesnap_common::DovesnapResult<()> {
//! let settings = Arc::new(DriverSettings::default());
//! let adapters = Adapters {
//!     switch: Arc::new(OvsSwitch::new(settings.paths.clone())),
//!     host: Arc::new(LinuxHost::new(settings.paths.clone())),
//!     faucet: Arc::new(FaucetConfClient::connect(&FaucetConnectConfig::default()).await?),
//!     runtime: Arc::new(DockerInspector::connect()?),
//! };
//! let (mut manager, handle) = ResourceManager::new(adapters, settings, None);
//! manager.rehydrate().await?;
//! tokio::spawn(manager.run());
//! let snapshot = handle.query().await?;
//! println!("{} networks", snapshot.networks.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod docker;
pub mod driver;
pub mod reconcile;
pub mod stack;

pub use config::DriverSettings;
pub use driver::{ManagerHandle, ResourceManager};

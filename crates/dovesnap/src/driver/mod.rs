//! Network lifecycle: options, state, and the manager that owns them.

pub mod manager;
pub mod operation;
pub mod options;
pub mod state;

pub use manager::{Adapters, ManagerHandle, ResourceManager};
pub use operation::{JoinInfo, Operation, PublishedPort};
pub use options::{BridgeMode, Gateway, NetworkOptions};
pub use state::{
    ContainerState, ExternalPortState, NetworkSnapshot, NetworkState, StackMirrorConfig,
    TopologySnapshot,
};

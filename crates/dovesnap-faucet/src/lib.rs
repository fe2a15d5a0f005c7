//! # dovesnap-faucet
//!
//! Faucet configuration documents and the faucetconfrpc client.
//!
//! - [`doc`]: typed, mergeable `dps:` fragments
//! - [`client`]: the [`FaucetConfig`] trait and its gRPC implementation

#![warn(missing_docs)]

pub mod client;
pub mod doc;
pub mod proto;

pub use client::{FaucetConfClient, FaucetConfig, FaucetConnectConfig, RemoteMirror};
pub use doc::{
    DpDoc, FaucetDoc, InterfaceDoc, StackLink, StackPriority, mirror_interface, parse_acls,
    stack_interface, vlan_interface,
};

//! # dovesnap-common
//!
//! Shared utilities and types for the dovesnap network plugin.
//!
//! This crate provides common functionality used across all dovesnap crates:
//! - Datapath id parsing and rendering
//! - Short identifiers derived from runtime ids
//! - Standard host paths
//! - Bounded retry for eventually consistent lookups
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;
pub mod retry;

pub use error::{DovesnapError, DovesnapResult};
pub use id::{DatapathId, short_engine_id, truncate_id};
pub use paths::DovesnapPaths;
pub use retry::{RetryPolicy, retry};

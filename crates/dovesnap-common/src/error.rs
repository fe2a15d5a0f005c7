//! Common error types for dovesnap.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`DovesnapError`].
pub type DovesnapResult<T> = Result<T, DovesnapError>;

/// Common errors across dovesnap.
#[derive(Error, Diagnostic, Debug)]
pub enum DovesnapError {
    /// Network not known to the driver.
    #[error("Network not found: {id}")]
    #[diagnostic(code(dovesnap::network::not_found))]
    NetworkNotFound {
        /// The network ID that was not found.
        id: String,
    },

    /// Endpoint not known to the driver or the runtime.
    #[error("Endpoint not found: {id}")]
    #[diagnostic(code(dovesnap::endpoint::not_found))]
    EndpointNotFound {
        /// The endpoint ID that was not found.
        id: String,
    },

    /// A network or driver option has an invalid value.
    #[error("Invalid value for {option}: {value} ({reason})")]
    #[diagnostic(
        code(dovesnap::option::invalid),
        help("Check the ovs.bridge.* options passed to docker network create")
    )]
    InvalidOption {
        /// The option name.
        option: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(dovesnap::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// A virtual switch control command failed.
    #[error("Switch command failed: {command}: {output}")]
    #[diagnostic(
        code(dovesnap::switch),
        help("Check that Open vSwitch is running and its database socket is reachable")
    )]
    Switch {
        /// The command line that failed.
        command: String,
        /// Combined output of the command.
        output: String,
    },

    /// The SDN controller's configuration service rejected a request.
    #[error("Controller request failed: {message}")]
    #[diagnostic(code(dovesnap::controller))]
    Controller {
        /// The error message.
        message: String,
    },

    /// The container runtime could not answer a query.
    #[error("Container runtime error: {message}")]
    #[diagnostic(code(dovesnap::runtime))]
    Runtime {
        /// The error message.
        message: String,
    },

    /// Host network plumbing (links, namespaces, NAT) failed.
    #[error("Host network error: {message}")]
    #[diagnostic(code(dovesnap::host))]
    Host {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(dovesnap::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(dovesnap::serialization))]
    Serialization(String),

    /// The resource manager is no longer accepting operations.
    #[error("Resource manager queue closed")]
    #[diagnostic(code(dovesnap::queue_closed))]
    QueueClosed,

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(dovesnap::internal),
        help("This is a bug, please report it at https://github.com/iqtlabs/dovesnap/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl DovesnapError {
    /// Shorthand for an [`DovesnapError::InvalidOption`].
    pub fn invalid_option(
        option: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            option: option.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DovesnapError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether retrying the failed call could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Controller { .. }
                | Self::Runtime { .. }
                | Self::NetworkNotFound { .. }
                | Self::EndpointNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for DovesnapError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

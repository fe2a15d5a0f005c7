//! DHCP client processes running inside container namespaces.

use dovesnap_common::{DovesnapError, DovesnapResult};
use tokio::process::{Child, Command};

/// A `udhcpc` process bound to one container's namespace.
#[derive(Debug)]
pub struct DhcpClient {
    netns: String,
    child: Option<Child>,
}

impl DhcpClient {
    /// Start `udhcpc -f -R` inside the named namespace.
    pub fn spawn(netns: &str) -> DovesnapResult<Self> {
        let child = Command::new("ip")
            .args(["netns", "exec", netns, "/sbin/udhcpc", "-f", "-R"])
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DovesnapError::Host {
                message: format!("Failed to start udhcpc in {netns}: {e}"),
            })?;
        tracing::info!(netns, "Started udhcpc");
        Ok(Self {
            netns: netns.to_string(),
            child: Some(child),
        })
    }

    /// A client with no process behind it.
    #[must_use]
    pub fn detached(netns: &str) -> Self {
        Self {
            netns: netns.to_string(),
            child: None,
        }
    }

    /// Namespace the client runs in.
    #[must_use]
    pub fn netns(&self) -> &str {
        &self.netns
    }

    /// Whether a process is attached.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Kill the process and reap it.
    pub async fn stop(mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::info!(netns = %self.netns, "Shutting down udhcpc");
            if let Err(e) = child.kill().await {
                tracing::warn!(netns = %self.netns, error = %e, "Failed to kill udhcpc");
            }
        }
    }
}

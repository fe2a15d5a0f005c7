//! Driver-wide settings.

use std::time::Duration;

use dovesnap_common::{DovesnapError, DovesnapPaths, DovesnapResult, RetryPolicy};

/// One uplink of the stacking bridge, `remote_dp:remote_port:local_interface`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackingInterface {
    /// Remote datapath name.
    pub remote_dp: String,
    /// Port on the remote datapath.
    pub remote_port: u32,
    /// Local host interface carrying the link.
    pub local_interface: String,
}

impl StackingInterface {
    /// Parse a comma separated list of `dp:port:interface` entries.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for entries that are not three fields
    /// with a numeric port.
    pub fn parse_list(list: &str) -> DovesnapResult<Vec<Self>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let fields: Vec<&str> = entry.split(':').collect();
                let [remote_dp, remote_port, local_interface] = fields.as_slice() else {
                    return Err(DovesnapError::config(format!(
                        "stacking interface {entry} must be dp:port:interface"
                    )));
                };
                let remote_port = remote_port.parse().map_err(|_| {
                    DovesnapError::config(format!("stacking interface {entry} has a bad port"))
                })?;
                Ok(Self {
                    remote_dp: (*remote_dp).to_string(),
                    remote_port,
                    local_interface: (*local_interface).to_string(),
                })
            })
            .collect()
    }
}

/// Collector for remote mirroring, `dp:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMirrorInterface {
    /// Datapath owning the collector port.
    pub dp: String,
    /// Collector port.
    pub port: u32,
}

impl StackMirrorInterface {
    /// Parse `dp:port`. An empty string means no remote mirroring.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for anything other than two fields
    /// with a numeric port.
    pub fn parse(spec: &str) -> DovesnapResult<Option<Self>> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(None);
        }
        let (dp, port) = spec
            .split_once(':')
            .filter(|(_, port)| !port.contains(':'))
            .ok_or_else(|| {
                DovesnapError::config(format!("stack mirror interface {spec} must be dp:port"))
            })?;
        let port = port.parse().map_err(|_| {
            DovesnapError::config(format!("stack mirror interface {spec} has a bad port"))
        })?;
        Ok(Some(Self {
            dp: dp.to_string(),
            port,
        }))
    }
}

/// Immutable driver configuration, shared by every component.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Stacking bridge uplinks.
    pub stacking_interfaces: Vec<StackingInterface>,
    /// Remote datapath given stack priority 1.
    pub stack_priority1: Option<String>,
    /// Collector for remote mirroring.
    pub stack_mirror_interface: Option<StackMirrorInterface>,
    /// Controllers used when a network does not name its own.
    pub default_controllers: Vec<String>,
    /// Optional input interface of the mirror bridge.
    pub mirror_bridge_in: Option<String>,
    /// Output interface of the mirror bridge.
    pub mirror_bridge_out: Option<String>,
    /// Period of the reconciliation loop.
    pub reconcile_interval: Duration,
    /// Retry policy for runtime lookups.
    pub runtime_retry: RetryPolicy,
    /// Capacity of the operation queue.
    pub queue_depth: usize,
    /// Host paths.
    pub paths: DovesnapPaths,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            stacking_interfaces: Vec::new(),
            stack_priority1: None,
            stack_mirror_interface: None,
            default_controllers: Vec::new(),
            mirror_bridge_in: None,
            mirror_bridge_out: None,
            reconcile_interval: Duration::from_secs(3),
            runtime_retry: RetryPolicy::RUNTIME,
            queue_depth: 64,
            paths: DovesnapPaths::new(),
        }
    }
}

impl DriverSettings {
    /// Set the stacking uplinks from `dp:port:interface,...`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed entries.
    pub fn with_stacking_interfaces(mut self, list: &str) -> DovesnapResult<Self> {
        self.stacking_interfaces = StackingInterface::parse_list(list)?;
        Ok(self)
    }

    /// Set the remote mirror collector from `dp:port`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the value is not `dp:port`.
    pub fn with_stack_mirror_interface(mut self, spec: &str) -> DovesnapResult<Self> {
        self.stack_mirror_interface = StackMirrorInterface::parse(spec)?;
        Ok(self)
    }

    /// Set the stack priority 1 datapath.
    #[must_use]
    pub fn with_stack_priority1(mut self, dp: impl Into<String>) -> Self {
        self.stack_priority1 = Some(dp.into()).filter(|dp: &String| !dp.is_empty());
        self
    }

    /// Set the default controllers from a comma separated list.
    #[must_use]
    pub fn with_default_controllers(mut self, list: &str) -> Self {
        self.default_controllers = split_list(list);
        self
    }

    /// Configure the mirror bridge.
    #[must_use]
    pub fn with_mirror_bridge(mut self, input: Option<String>, output: Option<String>) -> Self {
        self.mirror_bridge_in = input.filter(|name| !name.is_empty());
        self.mirror_bridge_out = output.filter(|name| !name.is_empty());
        self
    }

    /// Set the reconciliation period.
    #[must_use]
    pub const fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the runtime lookup retry policy.
    #[must_use]
    pub const fn with_runtime_retry(mut self, policy: RetryPolicy) -> Self {
        self.runtime_retry = policy;
        self
    }

    /// Set the host paths.
    #[must_use]
    pub fn with_paths(mut self, paths: DovesnapPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Check settings that depend on each other.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if stacking is enabled without default
    /// controllers.
    pub fn validate(&self) -> DovesnapResult<()> {
        if self.using_stacking() && self.default_controllers.is_empty() {
            return Err(DovesnapError::config(
                "stacking requires default OpenFlow controllers",
            ));
        }
        if self.reconcile_interval.is_zero() {
            return Err(DovesnapError::config("reconcile interval must be positive"));
        }
        Ok(())
    }

    /// A host mirror bridge is configured.
    #[must_use]
    pub const fn using_mirror_bridge(&self) -> bool {
        self.mirror_bridge_out.is_some()
    }

    /// Networks are stacked to other hosts. Off when a mirror bridge is used.
    #[must_use]
    pub fn using_stacking(&self) -> bool {
        !self.using_mirror_bridge() && !self.stacking_interfaces.is_empty()
    }

    /// Mirrored ports are tunneled to a remote collector over the stack.
    #[must_use]
    pub fn using_stack_mirroring(&self) -> bool {
        self.using_stacking() && self.stack_mirror_interface.is_some()
    }
}

/// Split a comma separated list, dropping empty entries.
#[must_use]
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// Read a boolean the way the runtime's own tooling writes them:
/// `1 t T TRUE true True` and `0 f F FALSE false False`.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

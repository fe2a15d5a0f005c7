//! Datapath ids and short identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DovesnapError, DovesnapResult};

/// Number of leading characters kept by [`truncate_id`].
pub const SHORT_ID_LEN: usize = 5;

/// A validated OpenFlow datapath id.
///
/// Datapath ids are configured as hex strings (`0x` prefix optional) and
/// handed to the controller in their decimal form. Zero is not a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatapathId(u64);

impl DatapathId {
    /// Create a datapath id from its integer form.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is zero.
    pub fn new(value: u64) -> DovesnapResult<Self> {
        if value == 0 {
            return Err(DovesnapError::invalid_option(
                "ovs.bridge.dpid",
                "0",
                "datapath id must be non-zero",
            ));
        }
        Ok(Self(value))
    }

    /// The decimal form used in controller documents.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Sixteen hex digits, as Open vSwitch expects in `other-config:datapath-id`.
    #[must_use]
    pub fn to_ovs_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl FromStr for DatapathId {
    type Err = DovesnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() {
            return Err(DovesnapError::invalid_option(
                "ovs.bridge.dpid",
                s,
                "datapath id is required",
            ));
        }
        let value = u64::from_str_radix(digits, 16).map_err(|e| {
            DovesnapError::invalid_option("ovs.bridge.dpid", s, e.to_string())
        })?;
        Self::new(value).map_err(|_| {
            DovesnapError::invalid_option("ovs.bridge.dpid", s, "datapath id must be non-zero")
        })
    }
}

impl TryFrom<String> for DatapathId {
    type Error = DovesnapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatapathId> for String {
    fn from(dpid: DatapathId) -> Self {
        dpid.to_string()
    }
}

/// Leading characters of a runtime id, used to build interface and bridge
/// names that fit the host's interface-name limit.
#[must_use]
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Shorten a container engine identity to six upper-case hex digits.
///
/// The first `:`-separated field of the engine id is read as a base-36
/// number and reduced to 24 bits. Characters outside the base-36 alphabet
/// are skipped.
#[must_use]
pub fn short_engine_id(engine_id: &str) -> String {
    let field = engine_id.split(':').next().unwrap_or_default();
    let value = field
        .chars()
        .filter_map(|c| c.to_digit(36))
        .fold(0u32, |acc, digit| {
            (acc.wrapping_mul(36).wrapping_add(digit)) & 0x00FF_FFFF
        });
    format!("{value:06X}")
}

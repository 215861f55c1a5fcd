//! Core identifiers and the ingestion entry type.

use serde::{Deserialize, Serialize};

/// Cluster-wide node identifier.
pub type NodeId = u64;

/// Monotonically increasing identifier of a cluster membership snapshot.
///
/// The affinity function is a pure function of `(cache, key, version)`: as
/// long as two callers agree on the version, they agree on key placement.
/// The minor component distinguishes placement-only changes (rebalances)
/// that do not correspond to a membership change.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TopologyVersion {
    pub major: u64,
    pub minor: u32,
}

impl TopologyVersion {
    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Next major version, resetting the minor component.
    pub fn next_major(self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
        }
    }
}

impl std::fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// One streamed key/value pair. A missing value denotes deletion.
///
/// Keys and values are opaque byte strings at this layer; interpretation is
/// left to the server-side receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Entry {
    /// Upsert entry.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Deletion entry.
    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }
}

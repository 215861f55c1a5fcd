//! Receiver descriptors and the local apply seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Entry;

/// Describes how a node applies a batch of streamed entries to its cache.
///
/// The descriptor travels marshalled inside every [`crate::StreamRequest`];
/// the server decodes it and picks the matching apply path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamReceiver {
    /// Write only initial values, skipping keys that already exist. The
    /// fastest path for bulk ingest.
    Isolated,
    /// Per-entry overwriting put through the normal cache API.
    Individual,
    /// User-supplied receiver code, shipped out of band and addressed by
    /// class name.
    Custom { class_name: String, payload: Vec<u8> },
}

impl StreamReceiver {
    /// Whether this receiver honors existing entries by overwriting them.
    /// Routing sends to the primary only when overwriting; the isolated
    /// receiver replicates to backups as well.
    pub fn overwrites(&self) -> bool {
        !matches!(self, StreamReceiver::Isolated)
    }
}

/// Apply path for batches whose destination is the originating process.
///
/// When the local node hosts a partition, the streamer skips the transport
/// and hands the batch to this seam as an in-process task. Implementations
/// live next to the node's storage engine; errors are surfaced verbatim on
/// the batch future.
#[async_trait]
pub trait LocalApply: Send + Sync + 'static {
    async fn apply(
        &self,
        cache_name: &str,
        receiver: &StreamReceiver,
        entries: Vec<Entry>,
        skip_store: bool,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_isolated_receiver_preserves_existing_entries() {
        assert!(!StreamReceiver::Isolated.overwrites());
        assert!(StreamReceiver::Individual.overwrites());
        assert!(StreamReceiver::Custom {
            class_name: "x.Receiver".into(),
            payload: vec![],
        }
        .overwrites());
    }
}

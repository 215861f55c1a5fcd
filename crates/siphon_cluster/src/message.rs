//! Wire messages exchanged between a streamer and the nodes it feeds.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{Entry, NodeId, TopologyVersion};

/// Well-known topic stream requests are addressed to on every node.
pub const STREAM_REQUEST_TOPIC: &[u8] = b"siphon.stream.req";

/// Build a response topic unique to one streamer instance on `node`.
///
/// Responses for all of a streamer's requests come back on this topic; the
/// per-process sequence keeps two streamers on the same node apart.
pub fn stream_topic(node: NodeId) -> Vec<u8> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("siphon.stream.resp/{node}/{seq}").into_bytes()
}

/// Code-shipping mode for receivers that carry user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployMode {
    Private,
    Isolated,
    Shared,
    Continuous,
}

/// Opaque deployment descriptor attached to requests whose receiver carries
/// user code. Streamers without code shipping leave it absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentMeta {
    pub mode: DeployMode,
    pub class_name: String,
    pub user_version: String,
    /// Participant nodes and their loader identifiers.
    pub participants: Vec<(NodeId, u64)>,
    pub classloader_id: u64,
}

/// One batched ingestion request addressed to a single node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Unique per destination buffer, monotonically increasing.
    pub request_id: u64,
    /// Topic the acknowledgment must be published on.
    pub response_topic: Vec<u8>,
    pub cache_name: String,
    /// Marshalled receiver descriptor applied server-side.
    pub receiver: Vec<u8>,
    pub entries: Vec<Entry>,
    /// True when no deployment metadata accompanies the receiver.
    pub ignore_deployment_topology: bool,
    pub skip_store: bool,
    pub allow_overwrite: bool,
    pub deployment: Option<DeploymentMeta>,
    /// Topology version the entries were routed against.
    pub topology_version: TopologyVersion,
}

/// Acknowledgment for one [`StreamRequest`]. A missing error means success.
///
/// The error payload is opaque at the streamer layer; it is decoded by the
/// streamer's [`crate::codec::WireCodec`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamResponse {
    pub request_id: u64,
    pub error: Option<Vec<u8>>,
}

impl StreamResponse {
    pub fn ok(request_id: u64) -> Self {
        Self {
            request_id,
            error: None,
        }
    }

    pub fn failed(request_id: u64, error: Vec<u8>) -> Self {
        Self {
            request_id,
            error: Some(error),
        }
    }
}

/// Decoded server-side failure carried in a response's error payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteError {
    /// Class of a custom receiver failure, when one was shipped.
    pub class_name: Option<String>,
    pub message: String,
    /// The node could not apply the batch at the request's topology version
    /// and asks the streamer to route it again.
    pub remap_required: bool,
}

impl RemoteError {
    pub fn apply_failed(message: impl Into<String>) -> Self {
        Self {
            class_name: None,
            message: message.into(),
            remap_required: false,
        }
    }

    pub fn remap_required(message: impl Into<String>) -> Self {
        Self {
            class_name: None,
            message: message.into(),
            remap_required: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_topics_are_unique_per_streamer() {
        assert_ne!(stream_topic(7), stream_topic(7));
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = StreamRequest {
            request_id: 42,
            response_topic: stream_topic(1),
            cache_name: "orders".into(),
            receiver: vec![1, 2, 3],
            entries: vec![Entry::put("k", "v"), Entry::remove("gone")],
            ignore_deployment_topology: true,
            skip_store: false,
            allow_overwrite: false,
            deployment: None,
            topology_version: TopologyVersion::new(5, 0),
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let back: StreamRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.request_id, 42);
        assert_eq!(back.entries.len(), 2);
        assert_eq!(back.topology_version, TopologyVersion::new(5, 0));
    }
}

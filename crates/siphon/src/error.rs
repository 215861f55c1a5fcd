//! Error taxonomy of the ingestion engine.

use siphon_cluster::NodeId;
use thiserror::Error;

/// Everything an ingestion operation, flush, or close can fail with.
///
/// The variants are `Clone` because a single failure fans out to every
/// listener of the affected batch. Only [`StreamError::TopologyChanged`] is
/// recoverable inside the engine (by routing the batch again at the current
/// topology version); every other kind propagates to the caller's future.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// The streamer was closed before the operation entered.
    #[error("streamer has been closed")]
    Closed,

    /// The client has been detached from the cluster.
    #[error("client disconnected from cluster: {detail}")]
    Disconnected { detail: String },

    /// No server node hosts the cache for some key. Not retried.
    #[error("no server node found for cache {cache_name} (all affinity nodes left or cache stopped)")]
    TopologyEmpty { cache_name: String },

    /// The destination departed or rejected the batch for remapping.
    /// Retried up to the remap budget.
    #[error("topology changed under node {node}: {detail}")]
    TopologyChanged { node: NodeId, detail: String },

    /// The remap budget was exhausted without a successful delivery.
    #[error("failed to finish operation (too many remaps): {remaps}")]
    RemapExhausted { remaps: u32 },

    /// Keys, values, or the receiver could not be marshalled. Not retried.
    #[error("marshalling failed: {0}")]
    Marshal(String),

    /// Low-level send failure with the destination still alive.
    #[error("failed to send request to node {node}: {detail}")]
    Transport { node: NodeId, detail: String },

    /// The server applied the batch and reported a failure.
    #[error("server-side apply failed on node {node}: {message}")]
    ServerApply { node: NodeId, message: String },

    /// The streamer was cancelled while the operation was outstanding.
    #[error("streamer has been cancelled")]
    Cancelled,

    /// The operation's input failed validation at ingress.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}

impl StreamError {
    /// Whether the remap loop may recover from this failure by routing the
    /// affected entries again at the current topology version.
    pub fn retryable(&self) -> bool {
        matches!(self, StreamError::TopologyChanged { .. })
    }

    pub(crate) fn disconnected(detail: impl Into<String>) -> Self {
        StreamError::Disconnected {
            detail: detail.into(),
        }
    }

    pub(crate) fn node_left(node: NodeId) -> Self {
        StreamError::TopologyChanged {
            node,
            detail: "node left before the batch was acknowledged".into(),
        }
    }
}

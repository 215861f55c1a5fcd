//! Cluster model shared by the siphon ingestion engine and its collaborators.
//!
//! The streamer engine in the `siphon` crate is deliberately ignorant of how
//! membership is tracked or how bytes move between processes. This crate
//! defines the seams it talks through: node/topology identifiers, the wire
//! messages, receiver descriptors, the [`Topology`] and [`Transport`] traits,
//! and in-process reference implementations ([`StaticTopology`],
//! [`ChannelTransport`]) used for embedded single-process deployments and
//! tests.

pub mod codec;
pub mod message;
pub mod receiver;
pub mod topology;
pub mod transport;
mod types;

pub use codec::{CodecError, JsonCodec, WireCodec};
pub use message::{
    stream_topic, DeployMode, DeploymentMeta, RemoteError, StreamRequest, StreamResponse,
    STREAM_REQUEST_TOPIC,
};
pub use receiver::{LocalApply, StreamReceiver};
pub use topology::{ClusterEvent, StaticTopology, Topology};
pub use transport::{ChannelTransport, InboundRequest, ResponseHandler, SendError, Transport};
pub use types::{Entry, NodeId, TopologyVersion};

//! Message transport seam and the in-process channel implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{StreamRequest, StreamResponse};
use crate::types::NodeId;

#[derive(Clone, Debug, Error)]
pub enum SendError {
    #[error("node {0} is not reachable")]
    Unreachable(NodeId),
    #[error("send to node {node} failed: {detail}")]
    Io { node: NodeId, detail: String },
}

/// Receives acknowledgments published on a streamer's response topic.
pub trait ResponseHandler: Send + Sync + 'static {
    /// `from` is the node that served the request.
    fn on_response(&self, from: NodeId, response: StreamResponse);
}

/// One-way request dispatch plus topic-addressed response delivery.
///
/// Sends are asynchronous: a send failure is observed either through the
/// returned error or, later, through the response channel. The streamer
/// registers one handler per response topic for its lifetime.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        node: NodeId,
        topic: &[u8],
        request: StreamRequest,
    ) -> Result<(), SendError>;

    fn add_response_handler(&self, topic: Vec<u8>, handler: Arc<dyn ResponseHandler>);

    fn remove_response_handler(&self, topic: &[u8]);
}

/// A request as seen by the serving node.
#[derive(Debug)]
pub struct InboundRequest {
    /// Node the request originated from.
    pub from: NodeId,
    /// Node the request is addressed to.
    pub to: NodeId,
    pub request: StreamRequest,
}

/// Loopback transport connecting streamers and node tasks inside one
/// process over unbounded channels. Used by embedded deployments, the
/// workload driver, and the test harness.
pub struct ChannelTransport {
    local: NodeId,
    nodes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<InboundRequest>>>,
    handlers: RwLock<HashMap<Vec<u8>, Arc<dyn ResponseHandler>>>,
}

impl ChannelTransport {
    pub fn new(local: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local,
            nodes: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Attach a serving node; the returned receiver yields its inbound
    /// requests. Re-registering a node replaces the previous attachment.
    pub fn register_node(&self, node: NodeId) -> mpsc::UnboundedReceiver<InboundRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.write().unwrap().insert(node, tx);
        rx
    }

    /// Detach a node; subsequent sends to it fail as unreachable.
    pub fn drop_node(&self, node: NodeId) {
        self.nodes.write().unwrap().remove(&node);
    }

    /// Publish a response on `topic`. Returns false when no handler is
    /// registered (the streamer is gone).
    pub fn respond(&self, topic: &[u8], from: NodeId, response: StreamResponse) -> bool {
        let handler = self.handlers.read().unwrap().get(topic).cloned();
        match handler {
            Some(handler) => {
                handler.on_response(from, response);
                true
            }
            None => {
                tracing::debug!(from, "dropping response, no handler on topic");
                false
            }
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        node: NodeId,
        _topic: &[u8],
        request: StreamRequest,
    ) -> Result<(), SendError> {
        let sender = self.nodes.read().unwrap().get(&node).cloned();
        let Some(sender) = sender else {
            return Err(SendError::Unreachable(node));
        };
        sender
            .send(InboundRequest {
                from: self.local,
                to: node,
                request,
            })
            .map_err(|_| SendError::Unreachable(node))
    }

    fn add_response_handler(&self, topic: Vec<u8>, handler: Arc<dyn ResponseHandler>) {
        self.handlers.write().unwrap().insert(topic, handler);
    }

    fn remove_response_handler(&self, topic: &[u8]) {
        self.handlers.write().unwrap().remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::stream_topic;
    use crate::types::{Entry, TopologyVersion};

    fn request(id: u64) -> StreamRequest {
        StreamRequest {
            request_id: id,
            response_topic: stream_topic(1),
            cache_name: "c".into(),
            receiver: vec![],
            entries: vec![Entry::put("k", "v")],
            ignore_deployment_topology: true,
            skip_store: false,
            allow_overwrite: false,
            deployment: None,
            topology_version: TopologyVersion::new(1, 0),
        }
    }

    struct Capture(std::sync::Mutex<Vec<u64>>);

    impl ResponseHandler for Capture {
        fn on_response(&self, _from: NodeId, response: StreamResponse) {
            self.0.lock().unwrap().push(response.request_id);
        }
    }

    #[tokio::test]
    async fn requests_reach_registered_nodes_and_responses_come_back() {
        let transport = ChannelTransport::new(1);
        let mut inbound = transport.register_node(2);

        transport.send(2, b"t", request(7)).await.unwrap();
        let seen = inbound.recv().await.unwrap();
        assert_eq!(seen.from, 1);
        assert_eq!(seen.request.request_id, 7);

        let capture = Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
        transport.add_response_handler(b"resp".to_vec(), capture.clone());
        assert!(transport.respond(b"resp", 2, StreamResponse::ok(7)));
        assert_eq!(*capture.0.lock().unwrap(), vec![7]);

        transport.remove_response_handler(b"resp");
        assert!(!transport.respond(b"resp", 2, StreamResponse::ok(8)));
    }

    #[tokio::test]
    async fn dropped_nodes_are_unreachable() {
        let transport = ChannelTransport::new(1);
        let _inbound = transport.register_node(2);
        transport.drop_node(2);
        assert!(matches!(
            transport.send(2, b"t", request(1)).await,
            Err(SendError::Unreachable(2))
        ));
    }
}

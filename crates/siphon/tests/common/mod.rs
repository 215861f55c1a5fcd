//! Shared in-process cluster harness for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use siphon::{ClusterServices, FlushScheduler, Streamer, StreamerConfig};
use siphon_cluster::{
    ChannelTransport, Entry, InboundRequest, JsonCodec, NodeId, RemoteError, StaticTopology,
    StreamReceiver, StreamResponse, Topology, WireCodec,
};

/// In-memory stand-in for one node's cache shard.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.rows.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.rows.lock().unwrap().contains_key(key)
    }

    /// Apply a batch with the receiver's semantics: isolated keeps existing
    /// values, individual overwrites, missing values delete.
    pub fn apply(&self, receiver: &StreamReceiver, entries: Vec<Entry>) {
        let mut rows = self.rows.lock().unwrap();
        for entry in entries {
            match entry.value {
                None => {
                    rows.remove(&entry.key);
                }
                Some(value) => {
                    if receiver.overwrites() {
                        rows.insert(entry.key, value);
                    } else {
                        rows.entry(entry.key).or_insert(value);
                    }
                }
            }
        }
    }
}

/// What a test node does with the next request.
#[derive(Clone, Debug)]
pub enum Mode {
    /// Apply and acknowledge.
    Normal,
    /// Swallow the request; the recorded acknowledgment can be released
    /// later with [`TestNode::release_silent`].
    Silent,
    /// Reject the next `n` requests with a remap-required error.
    RemapTimes(u32),
    /// Acknowledge with a server-side apply failure.
    ApplyError(String),
}

/// Behavior knobs and counters for one simulated node.
pub struct NodeBehavior {
    mode: Mutex<Mode>,
    /// While set, request handling pauses before acting.
    hold: AtomicBool,
    release: Notify,
    pub requests_seen: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Acknowledgments swallowed while silent: (topic, request id).
    swallowed: Mutex<Vec<(Vec<u8>, u64)>>,
}

impl NodeBehavior {
    fn new() -> Self {
        Self {
            mode: Mutex::new(Mode::Normal),
            hold: AtomicBool::new(false),
            release: Notify::new(),
            requests_seen: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            swallowed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
        if !hold {
            self.release.notify_waiters();
        }
    }

    async fn wait_while_held(&self) {
        loop {
            let released = self.release.notified();
            if !self.hold.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    /// Resolve the mode for one incoming request.
    fn next_action(&self) -> Mode {
        let mut mode = self.mode.lock().unwrap();
        let current = mode.clone();
        match current {
            Mode::RemapTimes(0) => Mode::Normal,
            Mode::RemapTimes(n) => {
                *mode = Mode::RemapTimes(n - 1);
                Mode::RemapTimes(n)
            }
            other => other,
        }
    }
}

/// One simulated server node.
pub struct TestNode {
    pub id: NodeId,
    pub store: Arc<MemoryStore>,
    pub behavior: Arc<NodeBehavior>,
    transport: Arc<ChannelTransport>,
}

impl TestNode {
    /// Acknowledge every request swallowed while silent. Returns how many
    /// acknowledgments actually reached a live response handler.
    pub fn release_silent(&self) -> usize {
        let swallowed: Vec<(Vec<u8>, u64)> =
            self.behavior.swallowed.lock().unwrap().drain(..).collect();
        swallowed
            .into_iter()
            .filter(|(topic, request_id)| {
                self.transport
                    .respond(topic, self.id, StreamResponse::ok(*request_id))
            })
            .count()
    }
}

fn spawn_node(
    id: NodeId,
    transport: Arc<ChannelTransport>,
    mut inbound: mpsc::UnboundedReceiver<InboundRequest>,
) -> TestNode {
    let store = Arc::new(MemoryStore::default());
    let behavior = Arc::new(NodeBehavior::new());
    let node = TestNode {
        id,
        store: store.clone(),
        behavior: behavior.clone(),
        transport: transport.clone(),
    };
    tokio::spawn(async move {
        let codec = JsonCodec::new();
        while let Some(req) = inbound.recv().await {
            behavior.requests_seen.fetch_add(1, Ordering::SeqCst);
            let current = behavior.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            behavior.max_in_flight.fetch_max(current, Ordering::SeqCst);

            let behavior = behavior.clone();
            let store = store.clone();
            let transport = transport.clone();
            let codec_clone = codec.clone();
            tokio::spawn(async move {
                behavior.wait_while_held().await;
                let request = req.request;
                let topic = request.response_topic.clone();
                match behavior.next_action() {
                    Mode::Normal => {
                        let receiver = codec_clone
                            .decode_receiver(&request.receiver)
                            .unwrap_or(StreamReceiver::Isolated);
                        store.apply(&receiver, request.entries);
                        transport.respond(&topic, id, StreamResponse::ok(request.request_id));
                    }
                    Mode::Silent => {
                        behavior
                            .swallowed
                            .lock()
                            .unwrap()
                            .push((topic, request.request_id));
                    }
                    Mode::RemapTimes(_) => {
                        let error = codec_clone
                            .encode_error(&RemoteError::remap_required("rebalance in progress"))
                            .unwrap();
                        transport
                            .respond(&topic, id, StreamResponse::failed(request.request_id, error));
                    }
                    Mode::ApplyError(message) => {
                        let error = codec_clone
                            .encode_error(&RemoteError::apply_failed(message))
                            .unwrap();
                        transport
                            .respond(&topic, id, StreamResponse::failed(request.request_id, error));
                    }
                }
                behavior.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });
    node
}

/// A whole in-process cluster plus the client-side collaborators.
pub struct TestCluster {
    pub topology: Arc<StaticTopology>,
    pub transport: Arc<ChannelTransport>,
    pub nodes: HashMap<NodeId, TestNode>,
}

/// Client processes use an id outside the member range.
pub const CLIENT: NodeId = 0;

impl TestCluster {
    pub fn start(members: usize, replication: usize) -> Self {
        let member_ids: Vec<NodeId> = (1..=members as NodeId).collect();
        let topology = Arc::new(StaticTopology::new(
            CLIENT,
            member_ids.clone(),
            replication,
        ));
        let transport = ChannelTransport::new(CLIENT);
        let mut nodes = HashMap::new();
        for id in member_ids {
            let inbound = transport.register_node(id);
            nodes.insert(id, spawn_node(id, transport.clone(), inbound));
        }
        Self {
            topology,
            transport,
            nodes,
        }
    }

    pub fn services(&self) -> ClusterServices {
        ClusterServices::new(
            self.topology.clone(),
            self.transport.clone(),
            Arc::new(JsonCodec::new()),
        )
    }

    pub fn streamer(&self, config: StreamerConfig) -> Streamer {
        Streamer::new(config, self.services()).expect("failed to build streamer")
    }

    pub fn streamer_with_scheduler(
        &self,
        config: StreamerConfig,
        scheduler: Arc<FlushScheduler>,
    ) -> Streamer {
        Streamer::new(config, self.services().flush_scheduler(scheduler))
            .expect("failed to build streamer")
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes.get(&id).expect("unknown test node")
    }

    pub fn store(&self, id: NodeId) -> &MemoryStore {
        &self.node(id).store
    }

    /// Drop a node both from membership and from the transport.
    pub fn kill_node(&self, id: NodeId) {
        self.transport.drop_node(id);
        self.topology.remove_node(id);
    }

    /// Generate `count` keys whose primary owner is `node` at the current
    /// ready version.
    pub fn keys_owned_by(&self, cache_name: &str, node: NodeId, count: usize) -> Vec<Vec<u8>> {
        let version = self.topology.ready_version();
        let mut keys = Vec::with_capacity(count);
        let mut probe = 0u64;
        while keys.len() < count {
            let key = format!("key-{probe}").into_bytes();
            if self.topology.map_primary(cache_name, &key, version) == Some(node) {
                keys.push(key);
            }
            probe += 1;
            assert!(probe < 1_000_000, "could not find keys owned by {node}");
        }
        keys
    }
}

/// [`LocalApply`] implementation over a [`MemoryStore`], for exercising the
/// local-node bypass.
pub struct LocalStore(pub Arc<MemoryStore>);

#[async_trait::async_trait]
impl siphon_cluster::LocalApply for LocalStore {
    async fn apply(
        &self,
        _cache_name: &str,
        receiver: &StreamReceiver,
        entries: Vec<Entry>,
        _skip_store: bool,
    ) -> anyhow::Result<()> {
        self.0.apply(receiver, entries);
        Ok(())
    }
}

/// Yield until `predicate` holds or `tries` scheduler turns have passed.
pub async fn settle(tries: usize, predicate: impl Fn() -> bool) -> bool {
    for _ in 0..tries {
        if predicate() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    predicate()
}

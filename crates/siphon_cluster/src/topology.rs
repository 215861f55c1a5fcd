//! Cluster membership view and the affinity oracle seam.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::types::{NodeId, TopologyVersion};

/// Membership changes a streamer reacts to. Left/failed events carry the
/// topology version produced by the change.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    NodeLeft {
        node: NodeId,
        version: TopologyVersion,
    },
    NodeFailed {
        node: NodeId,
        version: TopologyVersion,
    },
    /// The client process has been detached from the cluster entirely.
    Disconnected,
}

/// The streamer's window onto cluster membership and key placement.
///
/// Affinity answers must be stable: the same `(cache, key, version)` always
/// maps to the same node list, regardless of later membership changes.
#[async_trait]
pub trait Topology: Send + Sync + 'static {
    /// Identifier of the node this process runs on (or connects through).
    fn local_node(&self) -> NodeId;

    /// Latest version the affinity layer is ready to answer for.
    fn ready_version(&self) -> TopologyVersion;

    /// Latest version produced by membership changes, ready or not.
    fn version(&self) -> TopologyVersion;

    /// Wait until the affinity layer is ready at or after `version`.
    async fn await_ready(&self, version: TopologyVersion);

    fn is_alive(&self, node: NodeId) -> bool;

    /// Owning nodes for `key` at `version`: primary first, then backups.
    /// Empty when no server node hosts the cache at that version.
    fn map_primary_and_backups(
        &self,
        cache_name: &str,
        key: &[u8],
        version: TopologyVersion,
    ) -> Vec<NodeId>;

    /// Primary node for `key` at `version`.
    fn map_primary(&self, cache_name: &str, key: &[u8], version: TopologyVersion)
        -> Option<NodeId> {
        self.map_primary_and_backups(cache_name, key, version)
            .first()
            .copied()
    }

    /// Server nodes currently hosting `cache_name`.
    fn cache_nodes(&self, cache_name: &str) -> Vec<NodeId>;

    /// Subscribe to membership events.
    fn events(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// Versioned membership snapshots for an in-process cluster.
struct TopoState {
    version: TopologyVersion,
    alive: BTreeSet<NodeId>,
    /// Member snapshot per version, so affinity at old versions stays stable.
    snapshots: BTreeMap<TopologyVersion, Vec<NodeId>>,
    /// When set, version bumps do not mark the affinity layer ready; tests
    /// drive readiness through [`StaticTopology::mark_ready`].
    manual_ready: bool,
}

/// Fixed-membership topology with rendezvous-hash placement.
///
/// Backs embedded single-process deployments, the workload driver, and the
/// integration tests. Every member is assumed to host every cache.
pub struct StaticTopology {
    local: NodeId,
    replication: usize,
    state: RwLock<TopoState>,
    ready_tx: watch::Sender<TopologyVersion>,
    events_tx: broadcast::Sender<ClusterEvent>,
}

impl StaticTopology {
    /// Build a topology over `members` with `replication` owners per key
    /// (primary included). `local` need not be a member; a pure client
    /// process uses an id outside the member set.
    pub fn new(local: NodeId, members: impl IntoIterator<Item = NodeId>, replication: usize) -> Self {
        let alive: BTreeSet<NodeId> = members.into_iter().collect();
        let version = TopologyVersion::new(1, 0);
        let mut snapshots = BTreeMap::new();
        snapshots.insert(version, alive.iter().copied().collect());
        let (ready_tx, _) = watch::channel(version);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            local,
            replication: replication.max(1),
            state: RwLock::new(TopoState {
                version,
                alive,
                snapshots,
                manual_ready: false,
            }),
            ready_tx,
            events_tx,
        }
    }

    /// Decouple readiness from version bumps; pair with [`Self::mark_ready`].
    pub fn hold_readiness(&self) {
        self.state.write().unwrap().manual_ready = true;
    }

    /// Mark the affinity layer ready at `version`.
    pub fn mark_ready(&self, version: TopologyVersion) {
        self.ready_tx.send_replace(version);
    }

    /// Add a member, producing a new topology version.
    pub fn add_node(&self, node: NodeId) -> TopologyVersion {
        self.bump(|alive| {
            alive.insert(node);
        })
    }

    /// Remove a member gracefully and broadcast `NodeLeft`.
    pub fn remove_node(&self, node: NodeId) -> TopologyVersion {
        let version = self.bump(|alive| {
            alive.remove(&node);
        });
        let _ = self.events_tx.send(ClusterEvent::NodeLeft { node, version });
        version
    }

    /// Drop a member as failed and broadcast `NodeFailed`.
    pub fn fail_node(&self, node: NodeId) -> TopologyVersion {
        let version = self.bump(|alive| {
            alive.remove(&node);
        });
        let _ = self.events_tx.send(ClusterEvent::NodeFailed { node, version });
        version
    }

    /// Detach the client from the cluster.
    pub fn disconnect(&self) {
        let _ = self.events_tx.send(ClusterEvent::Disconnected);
    }

    fn bump(&self, mutate: impl FnOnce(&mut BTreeSet<NodeId>)) -> TopologyVersion {
        let mut state = self.state.write().unwrap();
        mutate(&mut state.alive);
        let version = state.version.next_major();
        state.version = version;
        let members: Vec<NodeId> = state.alive.iter().copied().collect();
        state.snapshots.insert(version, members);
        if !state.manual_ready {
            self.ready_tx.send_replace(version);
        }
        version
    }

    fn members_at(&self, version: TopologyVersion) -> Vec<NodeId> {
        let state = self.state.read().unwrap();
        state
            .snapshots
            .range(..=version)
            .next_back()
            .map(|(_, members)| members.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Topology for StaticTopology {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn ready_version(&self) -> TopologyVersion {
        *self.ready_tx.borrow()
    }

    fn version(&self) -> TopologyVersion {
        self.state.read().unwrap().version
    }

    async fn await_ready(&self, version: TopologyVersion) {
        let mut rx = self.ready_tx.subscribe();
        while *rx.borrow_and_update() < version {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.state.read().unwrap().alive.contains(&node)
    }

    fn map_primary_and_backups(
        &self,
        cache_name: &str,
        key: &[u8],
        version: TopologyVersion,
    ) -> Vec<NodeId> {
        let members = self.members_at(version);
        if members.is_empty() {
            return Vec::new();
        }
        // Rendezvous hashing: rank members by hash(cache, key, node) and take
        // the top `replication`. Stable per snapshot by construction.
        let mut ranked: Vec<(u64, NodeId)> = members
            .iter()
            .map(|&node| (placement_weight(cache_name, key, node), node))
            .collect();
        ranked.sort_by(|a, b| b.cmp(a));
        ranked
            .into_iter()
            .take(self.replication)
            .map(|(_, node)| node)
            .collect()
    }

    fn cache_nodes(&self, _cache_name: &str) -> Vec<NodeId> {
        self.state.read().unwrap().alive.iter().copied().collect()
    }

    fn events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events_tx.subscribe()
    }
}

fn placement_weight(cache_name: &str, key: &[u8], node: NodeId) -> u64 {
    let mut hasher = DefaultHasher::new();
    cache_name.hash(&mut hasher);
    key.hash(&mut hasher);
    node.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_is_stable_per_version() {
        let topo = StaticTopology::new(0, [1, 2, 3], 2);
        let v1 = topo.ready_version();
        let before = topo.map_primary_and_backups("c", b"key", v1);
        assert_eq!(before.len(), 2);

        topo.remove_node(before[0]);
        // The old version still answers with the old snapshot.
        assert_eq!(topo.map_primary_and_backups("c", b"key", v1), before);
        // The new version no longer places the departed node.
        let after = topo.map_primary_and_backups("c", b"key", topo.ready_version());
        assert!(!after.contains(&before[0]));
    }

    #[test]
    fn replication_is_capped_by_membership() {
        let topo = StaticTopology::new(0, [1, 2], 3);
        let owners = topo.map_primary_and_backups("c", b"key", topo.ready_version());
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn empty_membership_maps_to_no_owners() {
        let topo = StaticTopology::new(0, [1], 1);
        topo.remove_node(1);
        assert!(topo
            .map_primary_and_backups("c", b"key", topo.ready_version())
            .is_empty());
    }

    #[tokio::test]
    async fn readiness_can_lag_version_bumps() {
        let topo = StaticTopology::new(0, [1, 2], 1);
        topo.hold_readiness();
        let v2 = topo.remove_node(2);
        assert!(topo.ready_version() < v2);

        let wait = tokio::spawn({
            let ready = topo.ready_tx.subscribe();
            async move {
                let mut rx = ready;
                while *rx.borrow_and_update() < v2 {
                    rx.changed().await.unwrap();
                }
            }
        });
        topo.mark_ready(v2);
        wait.await.unwrap();
        assert_eq!(topo.ready_version(), v2);
    }
}

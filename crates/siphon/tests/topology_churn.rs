//! Remapping and topology-change handling: departed nodes, remap budgets,
//! transport failures, and cluster disconnects.

mod common;

use std::sync::atomic::Ordering;

use common::{settle, Mode, TestCluster};
use siphon::{StreamError, StreamerConfig};

fn config(cache: &str) -> StreamerConfig {
    StreamerConfig::new(cache).buf_size(1)
}

#[tokio::test]
async fn remap_required_responses_trigger_a_retry() {
    let cluster = TestCluster::start(2, 1);
    let streamer = cluster.streamer(config("c"));

    let key = cluster.keys_owned_by("c", 2, 1).remove(0);
    cluster.node(2).behavior.set_mode(Mode::RemapTimes(1));

    let fut = streamer.add(key.clone(), b"v".to_vec()).await.unwrap();
    fut.wait().await.unwrap();

    assert!(cluster.store(2).contains(&key));
    assert_eq!(streamer.stats().remaps, 1);
    assert!(
        cluster.node(2).behavior.requests_seen.load(Ordering::SeqCst) >= 2,
        "the rejected batch must be resubmitted"
    );
    streamer.close(false).await.unwrap();
}

#[tokio::test]
async fn remap_budget_exhaustion_fails_the_operation() {
    let cluster = TestCluster::start(2, 1);
    let streamer = cluster.streamer(config("c").max_remap(0));

    let key = cluster.keys_owned_by("c", 2, 1).remove(0);
    cluster.node(2).behavior.set_mode(Mode::RemapTimes(10));

    let fut = streamer.add(key, b"v".to_vec()).await.unwrap();
    assert!(matches!(
        fut.wait().await,
        Err(StreamError::RemapExhausted { .. })
    ));
    streamer.close(true).await.unwrap();
}

#[tokio::test]
async fn batches_in_flight_to_a_departed_node_are_rerouted() {
    let cluster = TestCluster::start(2, 1);
    let streamer = cluster.streamer(config("c"));

    let key = cluster.keys_owned_by("c", 2, 1).remove(0);
    cluster.node(2).behavior.set_mode(Mode::Silent);

    let fut = streamer.add(key.clone(), b"v".to_vec()).await.unwrap();
    assert!(
        settle(200, || {
            cluster.node(2).behavior.requests_seen.load(Ordering::SeqCst) == 1
        })
        .await,
        "batch must be in flight to node 2 before it departs"
    );
    assert!(!fut.is_done());

    // Node 2 leaves: its in-flight batch fails with a topology error and
    // the entries are routed again, landing on the remaining node.
    cluster.kill_node(2);
    fut.wait().await.unwrap();
    assert!(cluster.store(1).contains(&key));
    assert!(streamer.stats().remaps >= 1);
    streamer.close(false).await.unwrap();
}

#[tokio::test]
async fn buffered_entries_for_a_departed_node_are_rerouted_on_flush() {
    let cluster = TestCluster::start(2, 1);
    let streamer = cluster.streamer(StreamerConfig::new("c").buf_size(100));

    let key = cluster.keys_owned_by("c", 2, 1).remove(0);
    let fut = streamer.add(key.clone(), b"v".to_vec()).await.unwrap();
    assert!(!fut.is_done());

    cluster.kill_node(2);
    streamer.flush().await.unwrap();
    fut.wait().await.unwrap();
    assert!(cluster.store(1).contains(&key));
    streamer.close(false).await.unwrap();
}

#[tokio::test]
async fn empty_affinity_fails_the_operation_immediately() {
    let cluster = TestCluster::start(1, 1);
    let streamer = cluster.streamer(config("c"));

    cluster.kill_node(1);
    let fut = streamer.add("k", "v").await.unwrap();
    assert!(matches!(
        fut.wait().await,
        Err(StreamError::TopologyEmpty { .. })
    ));
    assert_eq!(streamer.stats().remaps, 0, "topology-empty is not retried");
    streamer.close(true).await.unwrap();
}

#[tokio::test]
async fn send_failures_to_a_live_node_surface_as_transport_errors() {
    let cluster = TestCluster::start(2, 1);
    let streamer = cluster.streamer(config("c"));

    let key = cluster.keys_owned_by("c", 2, 1).remove(0);
    // The node stays in the membership view but its transport link is gone.
    cluster.transport.drop_node(2);

    let fut = streamer.add(key, b"v".to_vec()).await.unwrap();
    assert!(matches!(
        fut.wait().await,
        Err(StreamError::Transport { node: 2, .. })
    ));
    streamer.close(true).await.unwrap();
}

#[tokio::test]
async fn the_routing_liveness_postcheck_detaches_stale_buffers() {
    let cluster = TestCluster::start(2, 1);
    let streamer = cluster.streamer(config("c"));

    let key = cluster.keys_owned_by("c", 2, 1).remove(0);
    // Membership drops node 2 but readiness lags, so routing still answers
    // with the old snapshot and the post-routing liveness check fires.
    cluster.topology.hold_readiness();
    let gone_at = cluster.topology.remove_node(2);

    let fut = streamer.add(key.clone(), b"v".to_vec()).await.unwrap();
    cluster.topology.mark_ready(gone_at);
    fut.wait().await.unwrap();

    // Entries routed after readiness catches up land on the survivor.
    let key2 = format!("after-{}", String::from_utf8_lossy(&key)).into_bytes();
    streamer
        .add(key2.clone(), b"v".to_vec())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(cluster.store(1).contains(&key2));
    streamer.close(false).await.unwrap();
}

#[tokio::test]
async fn disconnects_fail_everything_and_poison_ingress() {
    let cluster = TestCluster::start(1, 1);
    let streamer = cluster.streamer(config("c"));

    cluster.node(1).behavior.set_mode(Mode::Silent);
    let fut = streamer.add("k", "v").await.unwrap();
    assert!(
        settle(200, || {
            cluster.node(1).behavior.requests_seen.load(Ordering::SeqCst) == 1
        })
        .await
    );

    cluster.topology.disconnect();
    assert!(matches!(
        fut.wait().await,
        Err(StreamError::Disconnected { .. })
    ));
    assert!(matches!(
        streamer.completion().wait().await,
        Err(StreamError::Disconnected { .. })
    ));

    // Subsequent ingress reports the recorded disconnect cause, not a
    // generic closed error.
    assert!(matches!(
        streamer.add("k2", "v").await,
        Err(StreamError::Disconnected { .. })
    ));
    assert!(streamer.close(true).await.is_ok(), "close stays idempotent");
}

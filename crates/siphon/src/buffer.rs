//! Per-destination entry buffer with bounded in-flight batches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use siphon_cluster::{Entry, NodeId, StreamRequest, StreamResponse, TopologyVersion};

use crate::completion::{Completion, OpResult};
use crate::error::StreamError;
use crate::streamer::StreamerShared;

/// In-process apply task for a batch addressed to the local node.
struct LocalTask {
    batch: Arc<Completion>,
    handle: JoinHandle<()>,
}

/// Entries accumulating toward the next batch, and the future that batch
/// will resolve. The pair is swapped atomically at every overflow or flush;
/// an entry is never "partially" submitted.
struct BufState {
    entries: Vec<Entry>,
    batch: Arc<Completion>,
}

/// Accumulates entries destined for one node and gates their submission.
///
/// One buffer exists per live destination, created lazily on first routing.
/// Batches acquire a parallel-ops permit at submission; the permit is
/// released exactly when the batch future completes, so at most
/// `parallel_ops` batches are outstanding per destination and producers
/// block once the window is full.
pub(crate) struct NodeBuffer {
    node: NodeId,
    /// Destination is the originating process; batches bypass the transport.
    is_local: bool,
    shared: Arc<StreamerShared>,
    state: Mutex<BufState>,
    /// In-flight remote requests awaiting acknowledgment.
    requests: Mutex<HashMap<u64, Arc<Completion>>>,
    next_request_id: AtomicU64,
    local_tasks: Mutex<HashMap<u64, LocalTask>>,
    next_task_id: AtomicU64,
    permits: Arc<Semaphore>,
}

impl NodeBuffer {
    pub(crate) fn new(node: NodeId, shared: Arc<StreamerShared>) -> Self {
        let is_local = node == shared.topology.local_node() && shared.local_apply.is_some();
        let permits = Arc::new(Semaphore::new(shared.parallel_ops()));
        Self {
            node,
            is_local,
            shared,
            state: Mutex::new(BufState {
                entries: Vec::new(),
                batch: Arc::new(Completion::new()),
            }),
            requests: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            local_tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
            permits,
        }
    }

    /// Append `new_entries`, registering `listener` on the batch they join.
    ///
    /// On overflow the accumulated batch is submitted at `version` and its
    /// future returned; otherwise the entries stay buffered until the next
    /// overflow or flush and `None` is returned.
    pub(crate) async fn update(
        &self,
        new_entries: Vec<Entry>,
        version: TopologyVersion,
        listener: impl FnOnce(&OpResult) + Send + 'static,
    ) -> Result<Option<Arc<Completion>>, StreamError> {
        let taken = {
            let mut state = self.state.lock().unwrap();
            state.batch.listen(listener);
            state.entries.extend(new_entries);
            if state.entries.len() >= self.shared.buf_size() {
                let entries = std::mem::take(&mut state.entries);
                let old = std::mem::replace(&mut state.batch, Arc::new(Completion::new()));
                Some((entries, old))
            } else {
                None
            }
        };

        let Some((entries, old)) = taken else {
            // Entries buffered into a streamer that was torn down while we
            // appended would never be flushed; fail the accumulating batch
            // so its listeners resolve.
            if self.shared.is_cancelled() {
                let current = self.state.lock().unwrap().batch.clone();
                current.complete(Err(StreamError::Cancelled));
            } else if let Some(err) = self.shared.disconnect_error() {
                let current = self.state.lock().unwrap().batch.clone();
                current.complete(Err(err));
            }
            return Ok(None);
        };
        self.submit(entries, Some(version), old.clone()).await?;

        // The streamer may have been torn down while the submission was in
        // flight; the batch future must not be left dangling.
        if self.shared.is_cancelled() {
            old.complete(Err(StreamError::Cancelled));
        } else if let Some(err) = self.shared.disconnect_error() {
            old.complete(Err(err));
        }
        Ok(Some(old))
    }

    /// Swap out and submit whatever has accumulated, then report every batch
    /// still outstanding for this destination. `None` when nothing is
    /// outstanding.
    pub(crate) async fn flush(&self) -> Result<Option<Vec<Arc<Completion>>>, StreamError> {
        let taken = {
            let mut state = self.state.lock().unwrap();
            if state.entries.is_empty() {
                None
            } else {
                let entries = std::mem::take(&mut state.entries);
                let old = std::mem::replace(&mut state.batch, Arc::new(Completion::new()));
                Some((entries, old))
            }
        };

        let submitted = match taken {
            Some((entries, old)) => {
                self.submit(entries, None, old.clone()).await?;
                Some(old)
            }
            None => None,
        };

        let mut outstanding: Vec<Arc<Completion>> = Vec::new();
        {
            let mut tasks = self.local_tasks.lock().unwrap();
            tasks.retain(|_, task| !task.batch.is_done());
            outstanding.extend(tasks.values().map(|task| task.batch.clone()));
        }
        outstanding.extend(self.requests.lock().unwrap().values().cloned());
        if let Some(batch) = submitted {
            if !outstanding.iter().any(|other| Arc::ptr_eq(other, &batch)) {
                outstanding.push(batch);
            }
        }
        Ok((!outstanding.is_empty()).then_some(outstanding))
    }

    /// Submit one batch: acquire a permit, then either run the local apply
    /// task or marshal and hand the request to the transport.
    async fn submit(
        &self,
        entries: Vec<Entry>,
        version: Option<TopologyVersion>,
        batch: Arc<Completion>,
    ) -> Result<(), StreamError> {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Semaphore closed by cancel_all while we were waiting.
                batch.complete(Err(StreamError::Cancelled));
                return Err(StreamError::Cancelled);
            }
        };
        let stats = self.shared.stats();
        batch.listen(move |result| {
            match result {
                Ok(()) => stats.record_batch_acked(),
                Err(_) => stats.record_batch_failed(),
            }
            drop(permit);
        });
        self.shared.stats().record_batch_submitted();

        if self.is_local {
            self.submit_local(entries, batch);
            Ok(())
        } else {
            self.submit_remote(entries, version, batch).await
        }
    }

    fn submit_local(&self, entries: Vec<Entry>, batch: Arc<Completion>) {
        let Some(apply) = self.shared.local_apply.clone() else {
            // new() only marks buffers local when an apply target exists.
            batch.complete(Err(StreamError::ServerApply {
                node: self.node,
                message: "no local apply target".into(),
            }));
            return;
        };
        let shared = self.shared.clone();
        let node = self.node;
        let task_batch = batch.clone();
        let handle = tokio::spawn(async move {
            let receiver = shared.receiver();
            let result = apply
                .apply(&shared.cache_name, &receiver, entries, shared.skip_store())
                .await;
            task_batch.complete(result.map_err(|err| StreamError::ServerApply {
                node,
                message: err.to_string(),
            }));
        });

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.local_tasks.lock().unwrap();
        tasks.retain(|_, task| !task.batch.is_done());
        tasks.insert(task_id, LocalTask { batch, handle });
    }

    async fn submit_remote(
        &self,
        entries: Vec<Entry>,
        version: Option<TopologyVersion>,
        batch: Arc<Completion>,
    ) -> Result<(), StreamError> {
        let receiver = match self.shared.receiver_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(node = self.node, error = %err, "marshalling failed, request will not be sent");
                batch.complete(Err(err));
                return Ok(());
            }
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.requests
            .lock()
            .unwrap()
            .insert(request_id, batch.clone());

        let version = version.unwrap_or_else(|| self.shared.topology.ready_version());
        let deployment = self.shared.deployment();
        let request = StreamRequest {
            request_id,
            response_topic: self.shared.response_topic.clone(),
            cache_name: self.shared.cache_name.clone(),
            receiver,
            entries,
            ignore_deployment_topology: deployment.is_none(),
            skip_store: self.shared.skip_store(),
            allow_overwrite: self.shared.receiver().overwrites(),
            deployment,
            topology_version: version,
        };

        match self
            .shared
            .transport
            .send(self.node, siphon_cluster::STREAM_REQUEST_TOPIC, request)
            .await
        {
            Ok(()) => {
                debug!(node = self.node, request_id, "sent stream request");
                Ok(())
            }
            Err(err) => {
                self.requests.lock().unwrap().remove(&request_id);
                if self.shared.topology.is_alive(self.node) {
                    batch.complete(Err(StreamError::Transport {
                        node: self.node,
                        detail: err.to_string(),
                    }));
                } else {
                    // The destination is gone; let the remap loop reroute.
                    debug!(node = self.node, request_id, "send failed, node has left");
                    batch.complete(Err(StreamError::node_left(self.node)));
                }
                Ok(())
            }
        }
    }

    /// Resolve the in-flight request matching `response`. Responses for
    /// unknown ids are late arrivals after a remap already settled the
    /// batch; they are ignored.
    pub(crate) fn on_response(&self, response: StreamResponse) {
        let batch = self.requests.lock().unwrap().remove(&response.request_id);
        let Some(batch) = batch else {
            debug!(
                node = self.node,
                request_id = response.request_id,
                "ignoring response for unknown request"
            );
            self.shared.stats().record_response_ignored();
            return;
        };

        let result = match response.error {
            None => Ok(()),
            Some(bytes) => Err(match self.shared.codec.decode_error(&bytes) {
                Ok(remote) if remote.remap_required => StreamError::TopologyChanged {
                    node: self.node,
                    detail: remote.message,
                },
                Ok(remote) => StreamError::ServerApply {
                    node: self.node,
                    message: remote.message,
                },
                Err(err) => {
                    StreamError::Marshal(format!("failed to decode response error: {err}"))
                }
            }),
        };
        debug!(
            node = self.node,
            request_id = response.request_id,
            ok = result.is_ok(),
            "stream request finished"
        );
        batch.complete(result);
    }

    /// Called after this buffer was detached from the streamer's map because
    /// its destination departed. Submitted and still-accumulating batches
    /// are failed uniformly; the remap loop re-routes their entries through
    /// a fresh buffer at the new topology version.
    pub(crate) fn on_node_left(&self) {
        debug!(node = self.node, "forcibly completing batches (node has left)");
        let err = StreamError::node_left(self.node);
        let in_flight: Vec<Arc<Completion>> = self
            .requests
            .lock()
            .unwrap()
            .drain()
            .map(|(_, batch)| batch)
            .collect();
        for batch in in_flight {
            batch.complete(Err(err.clone()));
        }
        let current = self.state.lock().unwrap().batch.clone();
        current.complete(Err(err));
    }

    /// Best-effort teardown: abort local tasks, wake blocked submitters,
    /// and fail every outstanding batch with `err`.
    pub(crate) fn cancel_all(&self, err: Option<StreamError>) {
        let err = err.unwrap_or(StreamError::Cancelled);
        self.permits.close();

        let tasks: Vec<LocalTask> = self
            .local_tasks
            .lock()
            .unwrap()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.handle.abort();
            task.batch.complete(Err(err.clone()));
        }

        let in_flight: Vec<Arc<Completion>> = self
            .requests
            .lock()
            .unwrap()
            .drain()
            .map(|(_, batch)| batch)
            .collect();
        for batch in in_flight {
            batch.complete(Err(err.clone()));
        }

        let current = self.state.lock().unwrap().batch.clone();
        current.complete(Err(err));
    }
}

impl std::fmt::Debug for NodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.state.lock().unwrap().entries.len();
        f.debug_struct("NodeBuffer")
            .field("node", &self.node)
            .field("is_local", &self.is_local)
            .field("pending_entries", &pending)
            .field("in_flight", &self.requests.lock().unwrap().len())
            .finish()
    }
}

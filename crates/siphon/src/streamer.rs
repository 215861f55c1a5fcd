//! The streamer core: routing, remapping, flushing, teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use siphon_cluster::{
    stream_topic, ClusterEvent, DeploymentMeta, Entry, LocalApply, NodeId, ResponseHandler,
    StreamReceiver, StreamResponse, Topology, TopologyVersion, Transport, WireCodec,
};

use crate::buffer::NodeBuffer;
use crate::completion::Completion;
use crate::error::StreamError;
use crate::flush::FlushScheduler;
use crate::stats::{StatsSnapshot, StreamerStats};
use crate::{ClusterServices, StreamerConfig};

/// Caller-visible future of one `add`/`remove` invocation.
///
/// Resolves once every routed batch of the operation has been acknowledged,
/// or with the first terminal failure.
pub struct StreamFuture {
    completion: Arc<Completion>,
}

impl StreamFuture {
    pub async fn wait(&self) -> Result<(), StreamError> {
        self.completion.wait().await
    }

    pub fn try_result(&self) -> Option<Result<(), StreamError>> {
        self.completion.try_result()
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}

/// Configuration and collaborators shared between the streamer core and its
/// buffers. Buffers hold this handle rather than the streamer itself, so
/// ownership stays acyclic: streamer → buffer → shared.
pub(crate) struct StreamerShared {
    pub(crate) cache_name: String,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn WireCodec>,
    pub(crate) local_apply: Option<Arc<dyn LocalApply>>,
    pub(crate) response_topic: Vec<u8>,
    buf_size: AtomicUsize,
    parallel_ops: AtomicUsize,
    max_remap: AtomicU32,
    skip_store: AtomicBool,
    receiver: RwLock<StreamReceiver>,
    /// Lazily marshalled receiver, dropped whenever the receiver changes.
    receiver_bytes: Mutex<Option<Vec<u8>>>,
    deployment: RwLock<Option<DeploymentMeta>>,
    cancelled: AtomicBool,
    disconnected: Mutex<Option<StreamError>>,
    stats: Arc<StreamerStats>,
    overwrite_warned: AtomicBool,
}

impl StreamerShared {
    pub(crate) fn buf_size(&self) -> usize {
        self.buf_size.load(Ordering::Relaxed)
    }

    pub(crate) fn parallel_ops(&self) -> usize {
        self.parallel_ops.load(Ordering::Relaxed)
    }

    fn max_remap(&self) -> u32 {
        self.max_remap.load(Ordering::Relaxed)
    }

    pub(crate) fn skip_store(&self) -> bool {
        self.skip_store.load(Ordering::Relaxed)
    }

    pub(crate) fn receiver(&self) -> StreamReceiver {
        self.receiver.read().unwrap().clone()
    }

    pub(crate) fn deployment(&self) -> Option<DeploymentMeta> {
        self.deployment.read().unwrap().clone()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_error(&self) -> Option<StreamError> {
        self.disconnected.lock().unwrap().clone()
    }

    pub(crate) fn stats(&self) -> Arc<StreamerStats> {
        self.stats.clone()
    }

    /// Marshal the receiver once and reuse the bytes on every request.
    pub(crate) fn receiver_bytes(&self) -> Result<Vec<u8>, StreamError> {
        let mut cache = self.receiver_bytes.lock().unwrap();
        if let Some(bytes) = cache.as_ref() {
            return Ok(bytes.clone());
        }
        let receiver = self.receiver.read().unwrap().clone();
        let bytes = self
            .codec
            .encode_receiver(&receiver)
            .map_err(|err| StreamError::Marshal(err.to_string()))?;
        *cache = Some(bytes.clone());
        Ok(bytes)
    }

    fn set_receiver(&self, receiver: StreamReceiver) {
        *self.receiver.write().unwrap() = receiver;
        self.receiver_bytes.lock().unwrap().take();
    }
}

/// Tracks how many routed batches of one operation are still unacknowledged.
///
/// Every scheduled `(destination, entry group)` registers a slot, as does
/// every routing pass itself (so an operation cannot resolve while its
/// entries are mid-route). The operation future resolves successfully when
/// the last slot releases; failures complete the future directly and make
/// the remaining slot accounting moot.
struct OpTracker {
    op: Arc<Completion>,
    outstanding: AtomicUsize,
}

impl OpTracker {
    fn new(op: Arc<Completion>) -> Arc<Self> {
        Arc::new(Self {
            op,
            outstanding: AtomicUsize::new(1),
        })
    }

    fn register(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.op.complete(Ok(()));
        }
    }
}

pub(crate) struct StreamerInner {
    shared: Arc<StreamerShared>,
    bufs: RwLock<HashMap<NodeId, Arc<NodeBuffer>>>,
    active_ops: Mutex<HashMap<u64, Arc<Completion>>>,
    next_op_id: AtomicU64,
    /// Shared/exclusive lifecycle gate: ingress holds the shared side,
    /// close takes the exclusive side after flipping `closed`.
    busy: AsyncRwLock<()>,
    closed: AtomicBool,
    /// Terminal future of the streamer itself, completed by close.
    completion: Arc<Completion>,
    last_flush: Mutex<Instant>,
    auto_flush_interval: Mutex<Duration>,
    flush_scheduler: Arc<FlushScheduler>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// Routes acknowledgments from the response topic to the buffer of the
/// originating node. Holds the streamer weakly so a dropped streamer does
/// not linger in the transport.
struct ResponseDispatch {
    inner: Weak<StreamerInner>,
}

impl ResponseHandler for ResponseDispatch {
    fn on_response(&self, from: NodeId, response: StreamResponse) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let buf = inner.bufs.read().unwrap().get(&from).cloned();
        match buf {
            Some(buf) => buf.on_response(response),
            None => {
                debug!(node = from, "ignoring response, node buffer is gone");
                inner.shared.stats.record_response_ignored();
            }
        }
    }
}

/// Client-side bulk ingestion handle for one cache.
///
/// Entries are routed to their owning nodes by the injected affinity
/// oracle, batched per destination, and delivered at-least-once; topology
/// changes mid-flight are absorbed by remapping affected batches up to the
/// configured budget. Cheap to clone is not a goal: the handle owns the
/// engine, and dropping it while operations are pending keeps the engine
/// alive until they resolve.
pub struct Streamer {
    inner: Arc<StreamerInner>,
}

impl Streamer {
    /// Build a streamer and register it with the transport and topology
    /// event stream. Must be called from within a tokio runtime.
    pub fn new(config: StreamerConfig, services: ClusterServices) -> Result<Self, StreamError> {
        config.validate()?;
        let response_topic = stream_topic(services.topology.local_node());
        let shared = Arc::new(StreamerShared {
            cache_name: config.cache_name,
            topology: services.topology,
            transport: services.transport,
            codec: services.codec,
            local_apply: services.local_apply,
            response_topic: response_topic.clone(),
            buf_size: AtomicUsize::new(config.buf_size),
            parallel_ops: AtomicUsize::new(config.parallel_ops),
            max_remap: AtomicU32::new(config.max_remap),
            skip_store: AtomicBool::new(config.skip_store),
            receiver: RwLock::new(config.receiver),
            receiver_bytes: Mutex::new(None),
            deployment: RwLock::new(config.deployment),
            cancelled: AtomicBool::new(false),
            disconnected: Mutex::new(None),
            stats: Arc::new(StreamerStats::default()),
            overwrite_warned: AtomicBool::new(false),
        });
        let flush_scheduler = services
            .flush_scheduler
            .unwrap_or_else(FlushScheduler::new);
        let inner = Arc::new(StreamerInner {
            shared: shared.clone(),
            bufs: RwLock::new(HashMap::new()),
            active_ops: Mutex::new(HashMap::new()),
            next_op_id: AtomicU64::new(0),
            busy: AsyncRwLock::new(()),
            closed: AtomicBool::new(false),
            completion: Arc::new(Completion::new()),
            last_flush: Mutex::new(Instant::now()),
            auto_flush_interval: Mutex::new(Duration::ZERO),
            flush_scheduler,
            event_task: Mutex::new(None),
        });

        shared.transport.add_response_handler(
            response_topic,
            Arc::new(ResponseDispatch {
                inner: Arc::downgrade(&inner),
            }),
        );
        let events = shared.topology.events();
        let task = tokio::spawn(event_loop(Arc::downgrade(&inner), events));
        *inner.event_task.lock().unwrap() = Some(task);

        let streamer = Self { inner };
        if !config.auto_flush_interval.is_zero() {
            streamer.set_auto_flush_interval(config.auto_flush_interval);
        }
        Ok(streamer)
    }

    pub fn cache_name(&self) -> &str {
        &self.inner.shared.cache_name
    }

    /// Stream one upsert. Resolves when every owning node acknowledged it.
    pub async fn add(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<StreamFuture, StreamError> {
        self.inner.ingest(vec![Entry::put(key, value)]).await
    }

    /// Stream a batch of upserts.
    pub async fn add_all(
        &self,
        pairs: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<StreamFuture, StreamError> {
        let entries = pairs
            .into_iter()
            .map(|(key, value)| Entry::put(key, value))
            .collect();
        self.inner.ingest(entries).await
    }

    /// Stream a mixed batch of upserts and removals.
    pub async fn add_entries(&self, entries: Vec<Entry>) -> Result<StreamFuture, StreamError> {
        self.inner.ingest(entries).await
    }

    /// Stream one removal.
    pub async fn remove(&self, key: impl Into<Vec<u8>>) -> Result<StreamFuture, StreamError> {
        self.inner.ingest(vec![Entry::remove(key)]).await
    }

    /// Drain every buffer and wait until all prior operations resolved.
    pub async fn flush(&self) -> Result<(), StreamError> {
        let _busy = self.inner.enter_busy().await?;
        self.inner.do_flush().await
    }

    /// Best-effort drain: submit what has accumulated without waiting for
    /// acknowledgments. A closed streamer is a no-op.
    pub async fn try_flush(&self) -> Result<(), StreamError> {
        self.inner.try_flush().await
    }

    /// Close the streamer. `cancel=false` performs a final drain;
    /// `cancel=true` aborts in-flight batches and resolves every pending
    /// operation with a cancellation error. Idempotent.
    pub async fn close(&self, cancel: bool) -> Result<(), StreamError> {
        self.inner.close_ex(cancel, None).await
    }

    /// Terminal future of the streamer, completed by close (or disconnect).
    pub fn completion(&self) -> StreamFuture {
        StreamFuture {
            completion: self.inner.completion.clone(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.shared.stats.snapshot()
    }

    pub fn buf_size(&self) -> usize {
        self.inner.shared.buf_size()
    }

    /// Per-destination batch size. Applies to batches formed after the call.
    pub fn set_buf_size(&self, buf_size: usize) -> Result<(), StreamError> {
        if buf_size == 0 {
            return Err(StreamError::InvalidInput("buf_size must be > 0"));
        }
        self.inner.shared.buf_size.store(buf_size, Ordering::Relaxed);
        Ok(())
    }

    pub fn parallel_ops(&self) -> usize {
        self.inner.shared.parallel_ops()
    }

    /// Per-destination in-flight batch limit. Buffers created after the
    /// call pick up the new value; existing buffers keep their window.
    pub fn set_parallel_ops(&self, parallel_ops: usize) -> Result<(), StreamError> {
        if parallel_ops == 0 {
            return Err(StreamError::InvalidInput("parallel_ops must be > 0"));
        }
        self.inner
            .shared
            .parallel_ops
            .store(parallel_ops, Ordering::Relaxed);
        Ok(())
    }

    pub fn skip_store(&self) -> bool {
        self.inner.shared.skip_store()
    }

    pub fn set_skip_store(&self, skip_store: bool) {
        self.inner
            .shared
            .skip_store
            .store(skip_store, Ordering::Relaxed);
    }

    pub fn max_remap(&self) -> u32 {
        self.inner.shared.max_remap()
    }

    pub fn set_max_remap(&self, max_remap: u32) {
        self.inner
            .shared
            .max_remap
            .store(max_remap, Ordering::Relaxed);
    }

    pub fn receiver(&self) -> StreamReceiver {
        self.inner.shared.receiver()
    }

    /// Replace the receiver applied server-side. Invalidates the marshalled
    /// receiver cache; batches formed after the call carry the new one.
    pub fn set_receiver(&self, receiver: StreamReceiver) {
        self.inner.shared.set_receiver(receiver);
    }

    pub fn allow_overwrite(&self) -> bool {
        self.inner.shared.receiver().overwrites()
    }

    /// Switch between the isolated (write-if-absent) and individual
    /// (overwriting) receivers. Requires at least one server node hosting
    /// the cache, so the switch is observed by a live topology.
    pub fn set_allow_overwrite(&self, allow: bool) -> Result<(), StreamError> {
        if allow == self.allow_overwrite() {
            return Ok(());
        }
        let shared = &self.inner.shared;
        if shared.topology.cache_nodes(&shared.cache_name).is_empty() {
            return Err(StreamError::TopologyEmpty {
                cache_name: shared.cache_name.clone(),
            });
        }
        shared.set_receiver(if allow {
            StreamReceiver::Individual
        } else {
            StreamReceiver::Isolated
        });
        Ok(())
    }

    pub fn auto_flush_interval(&self) -> Duration {
        *self.inner.auto_flush_interval.lock().unwrap()
    }

    /// Periodic best-effort flushing. Zero deregisters.
    pub fn set_auto_flush_interval(&self, interval: Duration) {
        let inner = &self.inner;
        {
            let mut current = inner.auto_flush_interval.lock().unwrap();
            if *current == interval {
                return;
            }
            *current = interval;
        }
        if interval.is_zero() {
            inner.flush_scheduler.deregister(inner);
        } else {
            inner.flush_scheduler.register(inner, interval);
        }
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("cache_name", &self.inner.shared.cache_name)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl StreamerInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ingress_error(&self) -> StreamError {
        self.shared
            .disconnect_error()
            .unwrap_or(StreamError::Closed)
    }

    /// Take the shared busy token. Fails once the streamer is closed, with
    /// the recorded disconnect cause when there is one.
    async fn enter_busy(&self) -> Result<tokio::sync::RwLockReadGuard<'_, ()>, StreamError> {
        if self.is_closed() {
            return Err(self.ingress_error());
        }
        let guard = self.busy.read().await;
        if self.is_closed() {
            return Err(self.ingress_error());
        }
        Ok(guard)
    }

    async fn ingest(self: &Arc<Self>, entries: Vec<Entry>) -> Result<StreamFuture, StreamError> {
        if entries.is_empty() {
            return Err(StreamError::InvalidInput("entries must not be empty"));
        }
        let _busy = self.enter_busy().await?;

        if !self.shared.receiver().overwrites()
            && !self.shared.overwrite_warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                cache_name = %self.shared.cache_name,
                "streamer will not overwrite existing cache entries for better performance \
                 (enable overwrite to change)"
            );
        }

        let op = Arc::new(Completion::new());
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.active_ops.lock().unwrap().insert(op_id, op.clone());
        let weak = Arc::downgrade(self);
        op.listen(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.active_ops.lock().unwrap().remove(&op_id);
            }
        });

        self.shared.stats.record_entries(entries.len() as u64);
        let tracker = OpTracker::new(op.clone());
        self.clone().load(entries, tracker, 0).await;
        Ok(StreamFuture { completion: op })
    }

    /// Boxed entry into a routing pass, so remap listeners can re-enter it
    /// from inside a prior pass.
    fn load(
        self: Arc<Self>,
        entries: Vec<Entry>,
        tracker: Arc<OpTracker>,
        remaps: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.load_pass(entries, tracker, remaps))
    }

    /// One routing pass: map every entry to its owners at the ready
    /// topology version, group per destination, and hand each group to its
    /// buffer. Re-entered with an incremented counter when a batch fails
    /// with a retryable error.
    async fn load_pass(self: Arc<Self>, entries: Vec<Entry>, tracker: Arc<OpTracker>, remaps: u32) {
        // A remap retry can sit queued behind a cancelling close; routing
        // it afterward would recreate buffers nobody flushes or cancels.
        if self.shared.is_cancelled() {
            tracker.op.complete(Err(self
                .shared
                .disconnect_error()
                .unwrap_or(StreamError::Cancelled)));
            tracker.release();
            return;
        }
        let version = self.shared.topology.ready_version();
        let overwrite = self.shared.receiver().overwrites();

        let mut mappings: HashMap<NodeId, Vec<Entry>> = HashMap::new();
        for entry in entries {
            // Overwriting receivers go through the primary only; the
            // isolated receiver writes primary and backups directly.
            let nodes = if overwrite {
                self.shared
                    .topology
                    .map_primary(&self.shared.cache_name, &entry.key, version)
                    .map(|node| vec![node])
                    .unwrap_or_default()
            } else {
                self.shared.topology.map_primary_and_backups(
                    &self.shared.cache_name,
                    &entry.key,
                    version,
                )
            };
            if nodes.is_empty() {
                tracker.op.complete(Err(StreamError::TopologyEmpty {
                    cache_name: self.shared.cache_name.clone(),
                }));
                tracker.release();
                return;
            }
            for node in nodes {
                mappings.entry(node).or_default().push(entry.clone());
            }
        }

        for (node, group) in mappings {
            let group = Arc::new(group);
            tracker.register();
            let listener = {
                let inner = self.clone();
                let tracker = tracker.clone();
                let group = group.clone();
                move |result: &Result<(), StreamError>| match result {
                    Ok(()) => tracker.release(),
                    Err(err) => {
                        if matches!(err, StreamError::Disconnected { .. }) {
                            debug!(node, error = %err, "batch finished with disconnect error");
                            tracker.op.complete(Err(err.clone()));
                        } else if inner.shared.is_cancelled() {
                            tracker.op.complete(Err(StreamError::Cancelled));
                        } else if !err.retryable() {
                            debug!(node, error = %err, "batch finished with fatal error");
                            tracker.op.complete(Err(err.clone()));
                        } else if remaps + 1 > inner.shared.max_remap() {
                            tracker
                                .op
                                .complete(Err(StreamError::RemapExhausted { remaps }));
                        } else {
                            warn!(node, remap = remaps + 1, error = %err, "batch failed, remapping");
                            inner.shared.stats.record_remap();
                            let entries: Vec<Entry> = (*group).clone();
                            // The child routing pass inherits this group's
                            // tracker slot and releases it when done.
                            tokio::spawn(inner.clone().load(entries, tracker.clone(), remaps + 1));
                        }
                    }
                }
            };

            let buf = match self.buffer_for(node) {
                Ok(buf) => buf,
                Err(err) => {
                    tracker.op.complete(Err(err));
                    tracker.release();
                    return;
                }
            };
            let submitted = match buf.update((*group).clone(), version, listener).await {
                Ok(submitted) => submitted,
                Err(err) => {
                    tracker.op.complete(Err(err));
                    tracker.release();
                    return;
                }
            };

            // The affinity snapshot and the liveness check are not atomic;
            // the destination may have departed in between. Detach its
            // buffer and fail the batch so the remap loop reroutes it at
            // the next ready version.
            if !self.shared.topology.is_alive(node) {
                let detached = {
                    let mut bufs = self.bufs.write().unwrap();
                    match bufs.get(&node) {
                        Some(current) if Arc::ptr_eq(current, &buf) => {
                            bufs.remove(&node);
                            true
                        }
                        _ => false,
                    }
                };
                if detached {
                    let topology = self.shared.topology.clone();
                    let wait_version = topology.version();
                    let buf = buf.clone();
                    tokio::spawn(async move {
                        topology.await_ready(wait_version).await;
                        buf.on_node_left();
                        if let Some(batch) = submitted {
                            batch.complete(Err(StreamError::node_left(node)));
                        }
                    });
                }
            }
        }

        tracker.release();
    }

    /// Get or lazily create the buffer for `node`; concurrent creators
    /// race and the first insertion wins. Refuses once the streamer is
    /// cancelled: the check runs under the map's write lock, which the
    /// cancelling close also takes to drain the map, so a buffer inserted
    /// here is either cancelled by that drain or never created.
    fn buffer_for(&self, node: NodeId) -> Result<Arc<NodeBuffer>, StreamError> {
        if let Some(buf) = self.bufs.read().unwrap().get(&node) {
            return Ok(buf.clone());
        }
        let mut bufs = self.bufs.write().unwrap();
        if self.shared.is_cancelled() {
            return Err(self
                .shared
                .disconnect_error()
                .unwrap_or(StreamError::Cancelled));
        }
        Ok(bufs
            .entry(node)
            .or_insert_with(|| Arc::new(NodeBuffer::new(node, self.shared.clone())))
            .clone())
    }

    /// Flush every buffer and keep sweeping until each operation that was
    /// active on entry has terminally resolved. Batch failures inside a
    /// sweep are left to the remap loop and trigger another sweep; a
    /// disconnect aborts after the current sweep drains.
    async fn do_flush(&self) -> Result<(), StreamError> {
        *self.last_flush.lock().unwrap() = Instant::now();

        let mut pending: Vec<Arc<Completion>> = Vec::new();
        {
            let ops = self.active_ops.lock().unwrap();
            for op in ops.values() {
                match op.try_result() {
                    Some(Ok(())) => {}
                    Some(Err(err)) => return Err(err),
                    None => pending.push(op.clone()),
                }
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        loop {
            let bufs: Vec<Arc<NodeBuffer>> = self.bufs.read().unwrap().values().cloned().collect();
            let mut sweep: Vec<Arc<Completion>> = Vec::new();
            for buf in bufs {
                if let Some(batches) = buf.flush().await? {
                    sweep.extend(batches);
                }
            }

            let mut disconnected = None;
            let mut saw_failure = false;
            for batch in &sweep {
                match batch.wait().await {
                    Ok(()) => {}
                    Err(err @ StreamError::Disconnected { .. }) => disconnected = Some(err),
                    Err(err) => {
                        debug!(error = %err, "flushed batch failed, re-running sweep");
                        saw_failure = true;
                    }
                }
            }
            if let Some(err) = disconnected {
                return Err(err);
            }
            if saw_failure {
                // Remapped entries were re-buffered; flush them too.
                continue;
            }

            let mut all_done = true;
            for op in &pending {
                match op.try_result() {
                    Some(Ok(())) => {}
                    Some(Err(err)) => return Err(err),
                    None => {
                        all_done = false;
                        break;
                    }
                }
            }
            if all_done {
                return Ok(());
            }
            if sweep.is_empty() {
                // Nothing was outstanding in this sweep, so a remap pass is
                // still re-buffering entries; give it a beat.
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    pub(crate) async fn try_flush(&self) -> Result<(), StreamError> {
        let Ok(_busy) = self.enter_busy().await else {
            return Ok(());
        };
        let bufs: Vec<Arc<NodeBuffer>> = self.bufs.read().unwrap().values().cloned().collect();
        for buf in bufs {
            buf.flush().await?;
        }
        *self.last_flush.lock().unwrap() = Instant::now();
        Ok(())
    }

    fn cancel_buffers(&self, cause: Option<StreamError>) {
        let bufs: Vec<Arc<NodeBuffer>> = self.bufs.read().unwrap().values().cloned().collect();
        for buf in bufs {
            buf.cancel_all(cause.clone());
        }
    }

    /// Remove every buffer from the map, then cancel it. Removal holds the
    /// map's write lock and so serializes with `buffer_for`: a buffer
    /// created concurrently lands in the map before the drain and is
    /// cancelled here, and none can be created afterward.
    fn drain_and_cancel_buffers(&self, cause: Option<StreamError>) {
        let bufs: Vec<Arc<NodeBuffer>> = {
            let mut map = self.bufs.write().unwrap();
            map.drain().map(|(_, buf)| buf).collect()
        };
        for buf in bufs {
            buf.cancel_all(cause.clone());
        }
    }

    pub(crate) async fn close_ex(
        self: &Arc<Self>,
        cancel: bool,
        cause: Option<StreamError>,
    ) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(cache_name = %self.shared.cache_name, cancel, "closing streamer");

        let mut result = Ok(());
        if cancel {
            self.shared.cancelled.store(true, Ordering::SeqCst);
            // First sweep unblocks producers stuck on permits so the busy
            // token can drain; the second catches buffers created by
            // ingress that was already past the closed check and bars any
            // later creation.
            self.cancel_buffers(cause.clone());
            let _guard = self.busy.write().await;
            self.drain_and_cancel_buffers(cause.clone());
            // Operations still unresolved can only be waiting on work that
            // was just cancelled, including remap retries that will now
            // refuse to route.
            let stranded: Vec<Arc<Completion>> =
                self.active_ops.lock().unwrap().values().cloned().collect();
            for op in stranded {
                op.complete(Err(cause.clone().unwrap_or(StreamError::Cancelled)));
            }
        } else {
            let _guard = self.busy.write().await;
            result = self.do_flush().await;
        }

        self.shared
            .transport
            .remove_response_handler(&self.shared.response_topic);
        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
        self.flush_scheduler.deregister(self);
        self.bufs.write().unwrap().clear();

        let terminal = match (&result, cause) {
            (Err(err), _) => Err(err.clone()),
            (Ok(()), Some(cause)) => Err(cause),
            (Ok(()), None) => Ok(()),
        };
        self.completion.complete(terminal);
        result
    }

    fn on_node_departed(&self, node: NodeId, version: TopologyVersion) {
        let removed = self.bufs.write().unwrap().remove(&node);
        if let Some(buf) = removed {
            debug!(node, %version, "destination left, redistributing its buffer");
            let topology = self.shared.topology.clone();
            // Fail the buffer only once affinity answers at the new
            // version, so remaps do not loop on a stale view.
            tokio::spawn(async move {
                topology.await_ready(version).await;
                buf.on_node_left();
            });
        }
    }

    async fn on_disconnected(self: Arc<Self>) {
        let err = StreamError::disconnected("client node detached from cluster");
        warn!(cache_name = %self.shared.cache_name, "closing streamer, client disconnected");
        *self.shared.disconnected.lock().unwrap() = Some(err.clone());
        self.cancel_buffers(Some(err.clone()));
        let _ = self.close_ex(true, Some(err)).await;
    }
}

async fn event_loop(inner: Weak<StreamerInner>, mut events: broadcast::Receiver<ClusterEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cluster event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            ClusterEvent::NodeLeft { node, version }
            | ClusterEvent::NodeFailed { node, version } => {
                inner.on_node_departed(node, version);
            }
            ClusterEvent::Disconnected => {
                inner.on_disconnected().await;
            }
        }
    }
}

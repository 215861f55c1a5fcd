//! Client-side bulk ingestion engine for a partitioned key-value cluster.
//!
//! A [`Streamer`] accepts a continuous stream of upserts and removals for
//! one cache, maps each key to its owning nodes through the injected
//! affinity oracle, batches entries per destination, and bounds in-flight
//! work with a per-destination permit window. Topology changes mid-flight
//! are absorbed by remapping affected batches; delivery is at-least-once,
//! idempotent on the server side when overwriting is enabled.
//!
//! ```no_run
//! use std::sync::Arc;
//! use siphon::{ClusterServices, Streamer, StreamerConfig};
//! use siphon_cluster::{ChannelTransport, JsonCodec, StaticTopology};
//!
//! # async fn demo() -> Result<(), siphon::StreamError> {
//! let topology = Arc::new(StaticTopology::new(0, [1, 2, 3], 2));
//! let transport = ChannelTransport::new(0);
//! let streamer = Streamer::new(
//!     StreamerConfig::new("orders"),
//!     ClusterServices::new(topology, transport, Arc::new(JsonCodec::new())),
//! )?;
//!
//! let fut = streamer.add(b"k".to_vec(), b"v".to_vec()).await?;
//! streamer.flush().await?;
//! fut.wait().await?;
//! streamer.close(false).await?;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod completion;
mod error;
mod flush;
mod stats;
mod streamer;

use std::sync::Arc;
use std::time::Duration;

use siphon_cluster::{DeploymentMeta, LocalApply, StreamReceiver, Topology, Transport, WireCodec};

pub use error::StreamError;
pub use flush::FlushScheduler;
pub use stats::StatsSnapshot;
pub use streamer::{StreamFuture, Streamer};

/// Default per-destination batch size, in entries.
pub const DFLT_BUF_SIZE: usize = 1024;
/// Default per-destination in-flight batch limit.
pub const DFLT_PARALLEL_OPS: usize = 16;
/// Default remap budget per operation.
pub const DFLT_MAX_REMAP: u32 = 32;

/// Tuning knobs and initial mode of one streamer.
#[derive(Clone, Debug)]
pub struct StreamerConfig {
    pub cache_name: String,
    /// Entries buffered per destination before a batch is submitted.
    pub buf_size: usize,
    /// In-flight batches allowed per destination; the primary
    /// back-pressure knob.
    pub parallel_ops: usize,
    /// Periodic best-effort flushing; zero disables.
    pub auto_flush_interval: Duration,
    /// Bypass the server's persistent store when applying entries.
    pub skip_store: bool,
    pub receiver: StreamReceiver,
    /// Routing retries per operation before giving up on topology churn.
    pub max_remap: u32,
    /// Code-shipping metadata for custom receivers; absent by default.
    pub deployment: Option<DeploymentMeta>,
}

impl StreamerConfig {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            buf_size: DFLT_BUF_SIZE,
            parallel_ops: DFLT_PARALLEL_OPS,
            auto_flush_interval: Duration::ZERO,
            skip_store: false,
            receiver: StreamReceiver::Isolated,
            max_remap: DFLT_MAX_REMAP,
            deployment: None,
        }
    }

    pub fn buf_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }

    pub fn parallel_ops(mut self, parallel_ops: usize) -> Self {
        self.parallel_ops = parallel_ops;
        self
    }

    pub fn auto_flush_interval(mut self, interval: Duration) -> Self {
        self.auto_flush_interval = interval;
        self
    }

    pub fn skip_store(mut self, skip_store: bool) -> Self {
        self.skip_store = skip_store;
        self
    }

    pub fn receiver(mut self, receiver: StreamReceiver) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn max_remap(mut self, max_remap: u32) -> Self {
        self.max_remap = max_remap;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        if self.cache_name.is_empty() {
            return Err(StreamError::InvalidInput("cache_name must not be empty"));
        }
        if self.buf_size == 0 {
            return Err(StreamError::InvalidInput("buf_size must be > 0"));
        }
        if self.parallel_ops == 0 {
            return Err(StreamError::InvalidInput("parallel_ops must be > 0"));
        }
        Ok(())
    }
}

/// The collaborators a streamer plugs into.
pub struct ClusterServices {
    pub topology: Arc<dyn Topology>,
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn WireCodec>,
    /// Apply path for batches addressed to the local node; absent for pure
    /// client processes.
    pub local_apply: Option<Arc<dyn LocalApply>>,
    /// Shared auto-flush scheduler; one is created per streamer when absent.
    pub flush_scheduler: Option<Arc<FlushScheduler>>,
}

impl ClusterServices {
    pub fn new(
        topology: Arc<dyn Topology>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn WireCodec>,
    ) -> Self {
        Self {
            topology,
            transport,
            codec,
            local_apply: None,
            flush_scheduler: None,
        }
    }

    pub fn local_apply(mut self, local_apply: Arc<dyn LocalApply>) -> Self {
        self.local_apply = Some(local_apply);
        self
    }

    pub fn flush_scheduler(mut self, scheduler: Arc<FlushScheduler>) -> Self {
        self.flush_scheduler = Some(scheduler);
        self
    }
}

//! Periodic best-effort flushing for registered streamers.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::warn;

use crate::streamer::StreamerInner;

/// Re-check interval while the queue is empty, bounding how long a dropped
/// scheduler's worker lingers.
const IDLE_POLL: Duration = Duration::from_secs(1);

struct SchedEntry {
    deadline: Instant,
    interval: Duration,
    streamer: Weak<StreamerInner>,
}

/// Delay queue that periodically calls `try_flush` on every registered
/// streamer whose interval has elapsed.
///
/// One scheduler serves any number of streamers; its background worker
/// holds only weak references, so closed or dropped streamers fall out of
/// the queue on the next sweep. Sweep failures are logged, never
/// propagated.
pub struct FlushScheduler {
    entries: Mutex<Vec<SchedEntry>>,
    notify: Notify,
}

impl FlushScheduler {
    /// Create a scheduler and spawn its worker. Must be called from within
    /// a tokio runtime.
    pub fn new() -> Arc<Self> {
        let scheduler = Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        tokio::spawn(worker(Arc::downgrade(&scheduler)));
        scheduler
    }

    /// (Re-)register a streamer at `interval`. Replaces any prior entry.
    pub(crate) fn register(&self, streamer: &Arc<StreamerInner>, interval: Duration) {
        let weak = Arc::downgrade(streamer);
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| !entry.streamer.ptr_eq(&weak));
        entries.push(SchedEntry {
            deadline: Instant::now() + interval,
            interval,
            streamer: weak,
        });
        drop(entries);
        self.notify.notify_one();
    }

    pub(crate) fn deregister(&self, streamer: &Arc<StreamerInner>) {
        let weak = Arc::downgrade(streamer);
        self.entries
            .lock()
            .unwrap()
            .retain(|entry| !entry.streamer.ptr_eq(&weak));
        self.notify.notify_one();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.deadline)
            .min()
    }

    /// Pop due entries, pushing each back with a fresh deadline.
    fn take_due(&self, now: Instant) -> Vec<Weak<StreamerInner>> {
        let mut due = Vec::new();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| entry.streamer.strong_count() > 0);
        for entry in entries.iter_mut() {
            if entry.deadline <= now {
                entry.deadline = now + entry.interval;
                due.push(entry.streamer.clone());
            }
        }
        due
    }
}

async fn worker(scheduler: Weak<FlushScheduler>) {
    loop {
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        let notified = scheduler.notify.notified();
        match scheduler.next_deadline() {
            None => {
                tokio::select! {
                    _ = notified => {}
                    _ = time::sleep(IDLE_POLL) => {}
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = notified => {}
                    _ = time::sleep_until(deadline) => {}
                }
            }
        }

        let due = scheduler.take_due(Instant::now());
        // Release the strong handle before flushing; sweeps can take a
        // while and must not pin a scheduler every owner has dropped.
        drop(scheduler);
        for weak in due {
            let Some(streamer) = weak.upgrade() else {
                continue;
            };
            if streamer.is_closed() {
                continue;
            }
            if let Err(err) = streamer.try_flush().await {
                warn!(error = %err, "auto-flush sweep failed");
            }
        }
    }
}

//! One-shot settable futures with completion listeners.
//!
//! Batch and operation futures need two things tokio's primitives don't
//! offer together: multiple waiters, and synchronous listeners that run
//! exactly once on completion (delivery acknowledgments chain remaps and
//! permit releases through them). First completion wins; later completions
//! are ignored, which is what lets teardown paths race acknowledgment paths
//! safely.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::StreamError;

pub type OpResult = Result<(), StreamError>;

type Listener = Box<dyn FnOnce(&OpResult) + Send>;

struct State {
    done: Option<OpResult>,
    listeners: Vec<Listener>,
}

/// A settable one-shot future.
pub struct Completion {
    state: Mutex<State>,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                done: None,
                listeners: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Complete with `result`. The first caller wins and gets `true`;
    /// listeners run synchronously on its thread, in registration order.
    pub fn complete(&self, result: OpResult) -> bool {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.done.is_some() {
                return false;
            }
            state.done = Some(result.clone());
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener(&result);
        }
        self.notify.notify_waiters();
        true
    }

    /// Register a completion listener. Runs immediately when already done.
    pub fn listen(&self, listener: impl FnOnce(&OpResult) + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if let Some(result) = state.done.clone() {
            drop(state);
            listener(&result);
        } else {
            state.listeners.push(Box::new(listener));
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done.is_some()
    }

    pub fn try_result(&self) -> Option<OpResult> {
        self.state.lock().unwrap().done.clone()
    }

    /// Wait for completion.
    pub async fn wait(&self) -> OpResult {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.try_result())
            .finish()
    }
}

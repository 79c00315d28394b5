//! In-flight request tracking
//!
//! The loading flag is derived here: a channel is loading while any request
//! is pending or while it has no ready model. It is recomputed and published
//! under the same lock that guards the keys, so concurrent settles cannot
//! leave a stale value behind.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::signal::Signal;

#[derive(Debug, Default)]
struct PendingState {
    keys: HashSet<String>,
    ready: bool,
}

impl PendingState {
    fn loading(&self) -> bool {
        !self.keys.is_empty() || !self.ready
    }
}

/// Keys of requests that have been dispatched and not yet settled
#[derive(Debug)]
pub struct PendingSet {
    state: Mutex<PendingState>,
    loading: Signal<bool>,
}

impl Default for PendingSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingSet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            loading: Signal::new(true),
        }
    }

    /// Returns false if the key was already pending
    pub fn add(&self, key: &str) -> bool {
        self.update(|state| state.keys.insert(key.to_string()))
    }

    pub fn remove(&self, key: &str) -> bool {
        self.update(|state| state.keys.remove(key))
    }

    pub fn clear_all(&self) {
        self.update(|state| state.keys.clear());
    }

    /// Record whether the channel has a ready model
    pub fn set_ready(&self, ready: bool) {
        self.update(|state| state.ready = ready);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().keys.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.get()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    fn update<R>(&self, f: impl FnOnce(&mut PendingState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.loading.set(state.loading());
        result
    }
}

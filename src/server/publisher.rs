//! Store mutations paired with their hand-off to the broadcast loop

use crate::server::broadcast::BroadcastHandle;
use crate::server::store::EntryStore;
use crate::types::Entry;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Mutates the store and schedules delivery. Cheap to clone, usable from
/// any thread.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<EntryStore>,
    broadcaster: BroadcastHandle,
}

impl Publisher {
    /// Wrap a store and the handle of the loop that delivers it
    pub fn new(store: Arc<EntryStore>, broadcaster: BroadcastHandle) -> Self {
        Self { store, broadcaster }
    }

    /// Upsert an entry and schedule its broadcast
    pub fn send(&self, data: Value, id: Option<String>, view: Option<String>, append: bool) -> Entry {
        let entry = self.store.upsert(id, data, view, append);
        self.broadcaster.schedule_flush();
        entry
    }

    /// Wipe the store and broadcast the clear signal
    pub fn clear(&self) {
        self.store.clear();
        self.broadcaster.schedule_flush();
    }

    /// Remove one entry; viewers are not notified
    pub fn delete(&self, id: &str) -> bool {
        self.store.delete(id)
    }

    /// Current entries in first-seen order
    pub fn snapshot(&self) -> Vec<Entry> {
        self.store.snapshot()
    }

    /// Handle of the loop delivering this store
    pub fn broadcaster(&self) -> &BroadcastHandle {
        &self.broadcaster
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Whether every queued entry has been delivered
    pub fn is_settled(&self) -> bool {
        self.store.is_settled()
    }

    /// Block the calling thread until delivery settles or `timeout` passes.
    /// Returns whether it settled.
    pub fn wait_blocking(&self, poll: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.store.is_settled() {
                return true;
            }
            if !self.broadcaster.is_running() || Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(poll);
        }
    }

    /// Async counterpart of [`wait_blocking`](Self::wait_blocking)
    pub async fn wait_settled(&self, poll: Duration, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.store.is_settled() {
                return true;
            }
            if !self.broadcaster.is_running() || tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

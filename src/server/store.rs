//! Entry store and pending delivery queue

use crate::types::{generate_id, merge_append, Entry, CLEAR_SENTINEL};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

/// Ordered entries keyed by id, plus the queue of entries not yet handed to
/// the broadcast loop.
///
/// Both live behind one lock so that a mutation and its delivery intent are
/// recorded together, whichever thread makes them.
#[derive(Debug, Default)]
pub struct EntryStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: Vec<Entry>,
    pending: VecDeque<Entry>,
    in_flight: usize,
}

impl StoreInner {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    fn reset(&mut self, signal: Entry) -> Entry {
        self.entries.clear();
        self.pending.push_back(signal.clone());
        signal
    }
}

impl EntryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an entry and queue it for delivery.
    ///
    /// An existing id keeps its position; `append` merges the new data into
    /// the old value instead of replacing it. A `None` view keeps the current
    /// view. Without an id a fresh one is generated. Sending the clear
    /// sentinel behaves like [`clear`](Self::clear): it is queued, every
    /// entry is removed, and it is never stored.
    pub fn upsert(
        &self,
        id: Option<String>,
        data: Value,
        view: Option<String>,
        append: bool,
    ) -> Entry {
        let mut inner = self.inner.lock();

        if data.as_str() == Some(CLEAR_SENTINEL) {
            let signal = Entry::new(id.unwrap_or_else(generate_id), data, view);
            return inner.reset(signal);
        }

        let existing = id.as_deref().and_then(|id| inner.position(id));
        let entry = match existing {
            Some(index) => {
                let slot = &mut inner.entries[index];
                slot.data = if append {
                    merge_append(std::mem::take(&mut slot.data), data)
                } else {
                    data
                };
                if view.is_some() {
                    slot.view = view;
                }
                slot.clone()
            }
            None => {
                let entry = Entry::new(id.unwrap_or_else(generate_id), data, view);
                inner.entries.push(entry.clone());
                entry
            }
        };

        inner.pending.push_back(entry.clone());
        entry
    }

    /// Remove every entry and queue the clear signal
    pub fn clear(&self) -> Entry {
        self.inner.lock().reset(Entry::clear_signal())
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.position(id) {
            Some(index) => {
                inner.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// All entries in first-seen order
    pub fn snapshot(&self) -> Vec<Entry> {
        self.inner.lock().entries.clone()
    }

    /// Look up a single entry
    pub fn get(&self, id: &str) -> Option<Entry> {
        let inner = self.inner.lock();
        inner.position(id).map(|index| inner.entries[index].clone())
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Number of entries waiting to be taken by the broadcast loop
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Take every queued entry. They count as in flight until
    /// [`mark_delivered`](Self::mark_delivered) is called.
    pub fn drain_pending(&self) -> Vec<Entry> {
        let mut inner = self.inner.lock();
        let drained: Vec<Entry> = inner.pending.drain(..).collect();
        inner.in_flight += drained.len();
        drained
    }

    /// Take every queued entry together with the snapshot they lead to.
    ///
    /// Used when a viewer joins: older viewers get the queued entries, the
    /// newcomer gets the snapshot, and nothing falls between the two.
    pub fn drain_with_snapshot(&self) -> (Vec<Entry>, Vec<Entry>) {
        let mut inner = self.inner.lock();
        let drained: Vec<Entry> = inner.pending.drain(..).collect();
        inner.in_flight += drained.len();
        (drained, inner.entries.clone())
    }

    /// Record that `count` drained entries finished delivery
    pub fn mark_delivered(&self, count: usize) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(count);
    }

    /// True once nothing is queued and nothing drained is still being written
    pub fn is_settled(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && inner.in_flight == 0
    }
}

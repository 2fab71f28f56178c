//! Broadcast loop: the single owner of viewer sockets.
//!
//! Every write to a viewer happens here. Other threads and tasks talk to the
//! loop through a [`BroadcastHandle`], whose unbounded channel is safe to use
//! from any thread and keeps commands in the order they were sent.

use crate::server::store::EntryStore;
use crate::server::websocket::{encode_frame, encode_text, Frame};
use crate::types::Entry;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// A viewer that stops reading is dropped once a write stalls this long
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of an upgraded viewer connection
pub type ViewerSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifier handed out when a viewer joins
pub type ViewerId = u64;

enum Command {
    Flush,
    Join(ViewerId, ViewerSink),
    Leave(ViewerId),
}

/// Cloneable, thread-safe handle used to schedule work on the loop
#[derive(Clone)]
pub struct BroadcastHandle {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl BroadcastHandle {
    /// Ask the loop to deliver everything pending. Returns false once the
    /// loop has stopped.
    pub fn schedule_flush(&self) -> bool {
        self.tx.send(Command::Flush).is_ok()
    }

    /// Hand a freshly upgraded viewer to the loop. It receives the current
    /// snapshot before anything sent after this call.
    pub fn join(&self, sink: ViewerSink) -> Option<ViewerId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx.send(Command::Join(id, sink)).ok().map(|_| id)
    }

    /// Drop a viewer whose read side ended
    pub fn leave(&self, id: ViewerId) {
        let _ = self.tx.send(Command::Leave(id));
    }

    /// Whether the loop is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Viewer {
    id: ViewerId,
    sink: ViewerSink,
}

impl Viewer {
    async fn push(&mut self, frame: &Bytes) -> std::io::Result<()> {
        match tokio::time::timeout(WRITE_TIMEOUT, async {
            self.sink.write_all(frame).await?;
            self.sink.flush().await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "viewer write stalled",
            )),
        }
    }
}

/// The loop itself; run it with [`BroadcastLoop::run`]
pub struct BroadcastLoop {
    store: Arc<EntryStore>,
    rx: mpsc::UnboundedReceiver<Command>,
    viewers: Vec<Viewer>,
}

impl BroadcastLoop {
    /// Create a loop over `store` and the handle that drives it
    pub fn new(store: Arc<EntryStore>) -> (Self, BroadcastHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = BroadcastHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let this = Self {
            store,
            rx,
            viewers: Vec::new(),
        };
        (this, handle)
    }

    /// Process commands until shutdown or until every handle is dropped,
    /// then close all viewers.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Flush) => self.flush().await,
                        Some(Command::Join(id, sink)) => self.welcome(id, sink).await,
                        Some(Command::Leave(id)) => self.remove(id),
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        self.rx.close();
        self.close_all().await;
    }

    async fn flush(&mut self) {
        let pending = self.store.drain_pending();
        if pending.is_empty() {
            return;
        }
        if self.viewers.is_empty() {
            trace!(discarded = pending.len(), "No viewers connected");
            self.store.mark_delivered(pending.len());
            return;
        }
        self.deliver(&pending).await;
    }

    async fn welcome(&mut self, id: ViewerId, sink: ViewerSink) {
        let (pending, snapshot) = self.store.drain_with_snapshot();
        if self.viewers.is_empty() {
            self.store.mark_delivered(pending.len());
        } else {
            self.deliver(&pending).await;
        }

        let mut viewer = Viewer { id, sink };
        for entry in &snapshot {
            let Some(frame) = frame_for(entry) else {
                continue;
            };
            if let Err(e) = viewer.push(&frame).await {
                debug!(viewer = id, error = %e, "Viewer failed during backlog flush");
                return;
            }
        }

        debug!(
            viewer = id,
            backlog = snapshot.len(),
            viewers = self.viewers.len() + 1,
            "Viewer joined"
        );
        self.viewers.push(viewer);
    }

    /// Push entries in order to every viewer. A failing viewer is dropped
    /// without affecting the others.
    async fn deliver(&mut self, entries: &[Entry]) {
        for entry in entries {
            let Some(frame) = frame_for(entry) else {
                continue;
            };

            let mut failed = Vec::new();
            for viewer in self.viewers.iter_mut() {
                if let Err(e) = viewer.push(&frame).await {
                    debug!(viewer = viewer.id, error = %e, "Viewer write failed");
                    failed.push(viewer.id);
                }
            }
            for id in failed {
                self.remove(id);
            }
        }

        self.store.mark_delivered(entries.len());
        trace!(entries = entries.len(), viewers = self.viewers.len(), "Flushed pending entries");
    }

    fn remove(&mut self, id: ViewerId) {
        let before = self.viewers.len();
        self.viewers.retain(|viewer| viewer.id != id);
        if self.viewers.len() != before {
            debug!(viewer = id, viewers = self.viewers.len(), "Viewer left");
        }
    }

    async fn close_all(&mut self) {
        let close = encode_frame(Frame::close());
        for mut viewer in self.viewers.drain(..) {
            let _ = viewer.push(&close).await;
            let _ = viewer.sink.shutdown().await;
        }
    }
}

fn frame_for(entry: &Entry) -> Option<Bytes> {
    match entry.to_json() {
        Ok(json) => Some(encode_text(&json)),
        Err(e) => {
            warn!(id = %entry.id, error = %e, "Failed to serialize entry");
            None
        }
    }
}

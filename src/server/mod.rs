//! VizStream server implementation

pub mod broadcast;
pub mod dispatcher;
pub mod http;
pub mod publisher;
pub mod store;
pub mod websocket;

use crate::config::ServerConfig;
use crate::types::Entry;
use crate::{Result, VizError};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast as shutdown;
use tracing::{info, warn};

pub use broadcast::{BroadcastHandle, BroadcastLoop};
pub use dispatcher::Dispatcher;
pub use publisher::Publisher;
pub use store::EntryStore;

/// Pieces consumed the first time the server runs
struct RunParts {
    broadcast_loop: BroadcastLoop,
    loop_shutdown_rx: shutdown::Receiver<()>,
    dispatcher_shutdown_rx: shutdown::Receiver<()>,
}

/// Main VizStream server that coordinates all components
pub struct VizServer {
    config: ServerConfig,
    publisher: Publisher,
    shutdown_tx: shutdown::Sender<()>,
    parts: Mutex<Option<RunParts>>,
}

impl VizServer {
    /// Create a new VizStream server with the given configuration
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(EntryStore::new());
        let (broadcast_loop, broadcaster) = BroadcastLoop::new(Arc::clone(&store));
        let (shutdown_tx, loop_shutdown_rx) = shutdown::channel(1);
        let dispatcher_shutdown_rx = shutdown_tx.subscribe();

        Ok(Self {
            config,
            publisher: Publisher::new(store, broadcaster),
            shutdown_tx,
            parts: Mutex::new(Some(RunParts {
                broadcast_loop,
                loop_shutdown_rx,
                dispatcher_shutdown_rx,
            })),
        })
    }

    /// Handle for mutating the store and scheduling delivery
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| VizError::Bind(format!("Failed to bind {}: {}", addr, e)))
    }

    /// Bind and serve until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`shutdown`](Self::shutdown).
    /// A server can only be served once.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let parts = self
            .parts
            .lock()
            .take()
            .ok_or_else(|| VizError::Server("Server has already been started".to_string()))?;

        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "VizStream server listening");
        if self.config.server.show_url {
            println!("vizstream running on http://localhost:{}", local_addr.port());
        }

        let loop_task = tokio::spawn(parts.broadcast_loop.run(parts.loop_shutdown_rx));
        let dispatcher = Dispatcher::new(&self.config, self.publisher.clone());
        let result = dispatcher.serve(listener, parts.dispatcher_shutdown_rx).await;

        if let Err(e) = loop_task.await {
            warn!(error = %e, "Broadcast loop task failed");
        }
        info!("VizStream server stopped");
        result
    }

    /// Stop accepting connections and close every viewer. Safe to call any
    /// number of times, before or after the server starts.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A server running on its own thread with a single-threaded runtime.
///
/// Dropping the handle shuts the server down.
pub struct ServerHandle {
    publisher: Publisher,
    shutdown_tx: shutdown::Sender<()>,
    local_addr: SocketAddr,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// Start a server thread and wait until its listener is bound.
    ///
    /// A bind failure is returned here rather than logged on the thread.
    pub fn spawn(config: ServerConfig) -> Result<Self> {
        let server = VizServer::new(config)?;
        let publisher = server.publisher();
        let shutdown_tx = server.shutdown_tx.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<SocketAddr>>();

        let thread = std::thread::Builder::new()
            .name("vizstream-io".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VizError::Io(e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match server.bind().await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    match listener.local_addr() {
                        Ok(addr) => {
                            let _ = ready_tx.send(Ok(addr));
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(VizError::Io(e)));
                            return;
                        }
                    }
                    if let Err(e) = server.serve(listener).await {
                        warn!(error = %e, "VizStream server failed");
                    }
                });
            })?;

        let local_addr = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                let _ = thread.join();
                return Err(VizError::Server(
                    "Server thread exited during startup".to_string(),
                ));
            }
        };

        Ok(Self {
            publisher,
            shutdown_tx,
            local_addr,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for mutating the store and scheduling delivery
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Upsert an entry and schedule its broadcast
    pub fn send(&self, data: Value, id: Option<String>, view: Option<String>, append: bool) -> Entry {
        self.publisher.send(data, id, view, append)
    }

    /// Clear every entry and broadcast the clear signal
    pub fn clear(&self) {
        self.publisher.clear();
    }

    /// Block until everything queued has been delivered. Returns whether it
    /// settled before `timeout`.
    pub fn wait(&self, poll: Duration, timeout: Duration) -> bool {
        self.publisher.broadcaster().schedule_flush();
        self.publisher.wait_blocking(poll, timeout)
    }

    /// Stop the server and join its thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("VizStream server thread panicked");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.show_url = false;
        config
    }

    #[tokio::test]
    async fn test_server_creation_validates_config() {
        let mut config = local_config();
        config.server.read_chunk_size = 0;
        assert!(matches!(VizServer::new(config), Err(VizError::Config(_))));
    }

    #[tokio::test]
    async fn test_server_shutdown_response() {
        let server = Arc::new(VizServer::new(local_config()).unwrap());
        let listener = server.bind().await.unwrap();

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.serve(listener).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_server_runs_only_once() {
        let server = Arc::new(VizServer::new(local_config()).unwrap());
        server.shutdown();
        let first = server.serve(server.bind().await.unwrap()).await;
        assert!(first.is_ok());
        let second = server.serve(server.bind().await.unwrap()).await;
        assert!(matches!(second, Err(VizError::Server(_))));
    }

    #[test]
    fn test_handle_send_and_wait() {
        let handle = ServerHandle::spawn(local_config()).unwrap();
        assert_ne!(handle.local_addr().port(), 0);

        handle.send(json!([1]), Some("rows".into()), Some("table".into()), false);
        handle.send(json!([2]), Some("rows".into()), None, true);
        assert!(handle.wait(Duration::from_millis(5), Duration::from_secs(2)));

        let entry = handle.publisher().store().get("rows").unwrap();
        assert_eq!(entry.data, json!([1, 2]));
        assert_eq!(entry.view.as_deref(), Some("table"));
    }

    #[test]
    fn test_handle_shutdown_is_idempotent() {
        let handle = ServerHandle::spawn(local_config()).unwrap();
        let addr = handle.local_addr();
        handle.shutdown();
        handle.shutdown();
        assert!(std::net::TcpStream::connect(addr).is_err());
        drop(handle);
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = local_config();
        config.server.port = occupied.local_addr().unwrap().port();

        match ServerHandle::spawn(config) {
            Err(VizError::Bind(_)) => {}
            Err(other) => panic!("Expected bind error, got {}", other),
            Ok(_) => panic!("Expected bind error"),
        }
    }
}

//! TCP connection dispatcher and HTTP routes for VizStream

use crate::config::ServerConfig;
use crate::server::http::{self, HttpRequest, HttpResponse};
use crate::server::publisher::Publisher;
use crate::server::websocket::{self, FrameCodec};
use crate::types::SendRequest;
use crate::{Result, VizError};
use bytes::BytesMut;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Accepts connections, classifies each one as a plain HTTP request or a
/// WebSocket upgrade, and serves it
pub struct Dispatcher {
    context: Arc<Context>,
}

struct Context {
    config: ServerConfig,
    publisher: Publisher,
}

impl Dispatcher {
    /// Create a dispatcher serving the given publisher's store
    pub fn new(config: &ServerConfig, publisher: Publisher) -> Self {
        Self {
            context: Arc::new(Context {
                config: config.clone(),
                publisher,
            }),
        }
    }

    /// Accept connections until shutdown. Outstanding connection tasks are
    /// cancelled on the way out.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            trace!(%peer, "Accepted connection");
                            let context = Arc::clone(&self.context);
                            connections.spawn(async move {
                                context.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        connections.shutdown().await;
        Ok(())
    }
}

impl Context {
    async fn handle_connection(&self, stream: TcpStream) {
        if let Err(e) = self.serve_connection(stream).await {
            debug!(error = %e, "Connection ended with error");
        }
    }

    /// Bound a read from a client that may never finish sending
    async fn read_within<F, T>(&self, read: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.config.ws_read_timeout(), read).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(VizError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "client stopped sending",
            ))),
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut chunk = vec![0u8; self.config.server.read_chunk_size];
        let n = self.read_within(stream.read(&mut chunk)).await?;
        if n == 0 {
            return Ok(());
        }
        let buf = BytesMut::from(&chunk[..n]);

        if websocket::is_upgrade_request(&buf) {
            self.serve_viewer(stream, buf).await
        } else {
            self.serve_http(stream, buf).await
        }
    }

    async fn serve_http(&self, mut stream: TcpStream, buf: BytesMut) -> Result<()> {
        let limits = &self.config.limits;
        let request = self
            .read_within(http::read_request(
                &mut stream,
                buf,
                limits.max_head_bytes,
                limits.max_body_bytes,
            ))
            .await?;

        let response = self.route(&request).await;
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status,
            "Handled request"
        );

        response.write_to(&mut stream).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    async fn serve_viewer(&self, mut stream: TcpStream, mut buf: BytesMut) -> Result<()> {
        let limits = &self.config.limits;
        let head_end = self
            .read_within(http::read_head(&mut stream, &mut buf, limits.max_head_bytes))
            .await?
            .ok_or_else(|| VizError::Protocol("Incomplete handshake head".to_string()))?;
        let accept = websocket::accept_key_for_head(&buf[..head_end])?;

        stream
            .write_all(websocket::handshake_response(&accept).as_bytes())
            .await?;
        stream.flush().await?;

        let leftover = buf.split_off(head_end + 4);
        let (read_half, write_half) = stream.into_split();

        let broadcaster = self.publisher.broadcaster();
        let Some(viewer) = broadcaster.join(Box::new(write_half)) else {
            return Ok(());
        };

        let mut frames = FramedRead::new(read_half, FrameCodec::new(limits.max_frame_bytes));
        frames.read_buffer_mut().extend_from_slice(&leftover);

        let idle = self.config.ws_read_timeout();
        while let Some(frame) = websocket::next_frame(&mut frames, idle).await {
            trace!(viewer, opcode = ?frame.opcode, len = frame.payload.len(), "Ignoring viewer frame");
        }

        broadcaster.leave(viewer);
        Ok(())
    }

    async fn route(&self, request: &HttpRequest) -> HttpResponse {
        if !request.is_valid() {
            return HttpResponse::not_found();
        }

        let path = request.route();
        match (request.method.as_str(), path) {
            ("OPTIONS", _) => HttpResponse::ok(),
            ("GET", "/") => self.serve_asset("index.html").await,
            ("GET", "/api/entries") => self.entries(),
            ("GET", "/api/running") => HttpResponse::ok(),
            ("GET", "/api/wait") => self.wait().await,
            (_, path) if path.starts_with("/api/delete/") => {
                let id = &path["/api/delete/".len()..];
                self.publisher.delete(id);
                HttpResponse::ok()
            }
            ("DELETE", "/api/clear") => {
                self.publisher.clear();
                HttpResponse::ok()
            }
            ("POST", "/api/send") => self.send(request.body.as_deref()),
            ("GET", path) => self.serve_asset(path.trim_start_matches('/')).await,
            _ => HttpResponse::not_found(),
        }
    }

    fn entries(&self) -> HttpResponse {
        match serde_json::to_vec(&self.publisher.snapshot()) {
            Ok(json) => HttpResponse::json(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize entries");
                HttpResponse::internal_error()
            }
        }
    }

    fn send(&self, body: Option<&str>) -> HttpResponse {
        let Some(body) = body else {
            return HttpResponse::not_found();
        };
        let mut request: SendRequest = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejected send body");
                return HttpResponse::not_found();
            }
        };

        match request.take_accepted_data() {
            Some(data) => {
                self.publisher
                    .send(data, request.id, request.view, request.append);
                HttpResponse::ok()
            }
            None => HttpResponse::not_found(),
        }
    }

    async fn wait(&self) -> HttpResponse {
        self.publisher.broadcaster().schedule_flush();
        let timeout = Duration::from_secs(self.config.limits.wait_timeout_secs);
        if self.publisher.wait_settled(WAIT_POLL, timeout).await {
            HttpResponse::ok()
        } else {
            HttpResponse::internal_error()
        }
    }

    async fn serve_asset(&self, relative: &str) -> HttpResponse {
        let Some(path) = asset_path(&self.config.assets.dist_path, relative) else {
            return HttpResponse::not_found();
        };

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => match tokio::fs::read(&path).await {
                Ok(content) => HttpResponse::with_body(http::content_type_for(&path), content),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to read asset");
                    HttpResponse::not_found()
                }
            },
            _ => HttpResponse::not_found(),
        }
    }
}

/// Resolve a request path inside the asset directory. Anything that could
/// step outside it is refused.
fn asset_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty() {
        return None;
    }
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

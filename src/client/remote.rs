//! Liveness probe and HTTP forwarding used when another process already
//! serves the target port

use crate::server::http::{encode_request, read_response};
use crate::types::{Entry, SendRequest};
use crate::{Result, VizError};
use bytes::Bytes;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Ask `addr` whether a server is already running there.
///
/// A refused connection means the port is free for a new server. Any HTTP
/// response counts as a running instance. A peer that accepts but does not
/// answer in time is reported as not running, so the following bind attempt
/// surfaces the conflict.
pub async fn probe_running(addr: &str, probe_timeout: Duration) -> Result<bool> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(&encode_request("GET", "/api/running", addr, None))
            .await?;
        read_response(&mut stream, MAX_RESPONSE_HEAD).await
    };

    match timeout(probe_timeout, attempt).await {
        Ok(Ok(Some((status, _)))) => {
            debug!(addr, status, "Found running server");
            Ok(true)
        }
        Ok(Ok(None)) => Ok(false),
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => Ok(false),
        Ok(Err(e)) => Err(VizError::Connection(format!("Probe of {} failed: {}", addr, e))),
        Err(_) => {
            debug!(addr, "Probe timed out");
            Ok(false)
        }
    }
}

/// Forwards facade calls to a running server over HTTP
#[derive(Debug, Clone)]
pub struct RemoteServer {
    addr: String,
    request_timeout: Duration,
}

impl RemoteServer {
    /// Forward to the server at `addr`
    pub fn new(addr: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            request_timeout,
        }
    }

    /// Issue one request on a fresh connection and return status and body
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
        limit: Duration,
    ) -> Result<(u16, Bytes)> {
        let exchange = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream
                .write_all(&encode_request(method, path, &self.addr, body))
                .await?;
            read_response(&mut stream, MAX_RESPONSE_HEAD).await
        };

        match timeout(limit, exchange).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(VizError::Protocol(format!(
                "{} {} returned a non-HTTP response",
                method, path
            ))),
            Ok(Err(e)) => Err(VizError::Connection(format!(
                "{} {} to {} failed: {}",
                method, path, self.addr, e
            ))),
            Err(_) => Err(VizError::Connection(format!(
                "{} {} to {} timed out",
                method, path, self.addr
            ))),
        }
    }

    /// `POST /api/send`
    pub async fn send(&self, request: &SendRequest) -> Result<()> {
        let body = serde_json::to_vec(request)?;
        let (status, _) = self
            .request("POST", "/api/send", Some(&body), self.request_timeout)
            .await?;
        expect_ok(status, "send")
    }

    /// `DELETE /api/clear`
    pub async fn clear(&self) -> Result<()> {
        let (status, _) = self
            .request("DELETE", "/api/clear", None, self.request_timeout)
            .await?;
        expect_ok(status, "clear")
    }

    /// `GET /api/wait`, allowed to block for up to `limit`
    pub async fn wait(&self, limit: Duration) -> Result<()> {
        let (status, _) = self
            .request("GET", "/api/wait", None, limit + self.request_timeout)
            .await?;
        expect_ok(status, "wait")
    }

    /// `GET /api/entries`
    pub async fn entries(&self) -> Result<Vec<Entry>> {
        let (status, body) = self
            .request("GET", "/api/entries", None, self.request_timeout)
            .await?;
        expect_ok(status, "entries")?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn expect_ok(status: u16, operation: &str) -> Result<()> {
    if status == 200 {
        Ok(())
    } else {
        Err(VizError::Client(format!(
            "Server rejected {} with status {}",
            operation, status
        )))
    }
}

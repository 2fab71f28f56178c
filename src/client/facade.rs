//! Blocking client API.
//!
//! A [`Client`] either owns an embedded server on its own I/O thread or,
//! when the liveness probe finds a server already running on the port,
//! forwards every call to it over HTTP. Calls may come from any thread but
//! must not be made from inside an async runtime.

use crate::client::remote::{probe_running, RemoteServer};
use crate::config::ClientConfig;
use crate::server::ServerHandle;
use crate::types::{log_record, Entry, SendRequest, View, DEFAULT_LOG_ID};
use crate::{Result, VizError};
use serde::Serialize;
use serde_json::Value;
use std::backtrace::Backtrace;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Optional arguments for [`Client::send_with`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Target identifier; a fresh one is generated when absent
    pub id: Option<String>,
    /// Renderer tag
    pub view: Option<String>,
    /// Merge into the existing value instead of replacing it
    pub append: bool,
    /// Block until the update has been delivered
    pub wait: bool,
}

impl SendOptions {
    /// Options with every field unset
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identifier
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the renderer tag
    pub fn view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    /// Merge instead of replace
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Wait for delivery before returning
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }
}

enum Backend {
    Local(ServerHandle),
    Remote {
        runtime: Runtime,
        remote: RemoteServer,
    },
}

/// Entry point for pushing values to dashboards
pub struct Client {
    config: ClientConfig,
    backend: Backend,
}

impl Client {
    /// Client configured from `VIZSTREAM_*` environment variables
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::load()?)
    }

    /// Client on a specific port, other settings from the environment
    pub fn with_port(port: u16) -> Result<Self> {
        let mut config = ClientConfig::load()?;
        config.port = port;
        Self::with_config(config)
    }

    /// Probe the configured port, then attach to the server found there or
    /// start a new one.
    ///
    /// Fails with [`VizError::Bind`] when the port is held by something that
    /// is not a VizStream server.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let addr = config.server_addr();
        let running = runtime.block_on(probe_running(
            &addr,
            Duration::from_millis(config.probe_timeout_ms),
        ))?;

        let backend = if running {
            info!(addr = %addr, "Attaching to running VizStream server");
            Backend::Remote {
                runtime,
                remote: RemoteServer::new(addr, Duration::from_millis(config.request_timeout_ms)),
            }
        } else {
            drop(runtime);
            let handle = ServerHandle::spawn(config.server_config())?;
            if config.show_url {
                println!(
                    "vizstream running on http://localhost:{}",
                    handle.local_addr().port()
                );
            }
            Backend::Local(handle)
        };

        Ok(Self { config, backend })
    }

    /// Whether calls are forwarded to a server owned by another client
    pub fn is_attached(&self) -> bool {
        matches!(self.backend, Backend::Remote { .. })
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Store `value` under `id` (or a fresh id) and broadcast it
    pub fn send<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        let mut options = SendOptions::new();
        options.id = id.map(str::to_string);
        self.send_with(value, options)
    }

    /// Store and broadcast with full control over view, append and wait
    pub fn send_with<T: Serialize>(&self, value: T, options: SendOptions) -> Result<()> {
        let data = serde_json::to_value(value)?;
        match &self.backend {
            Backend::Local(handle) => {
                let entry = handle.send(data, options.id, options.view, options.append);
                debug!(id = %entry.id, append = options.append, "Entry sent");
            }
            Backend::Remote { runtime, remote } => {
                let request = SendRequest {
                    data: Some(data),
                    id: options.id,
                    view: options.view,
                    append: options.append,
                };
                runtime.block_on(remote.send(&request))?;
            }
        }

        if options.wait {
            self.wait()?;
        }
        Ok(())
    }

    /// Remove every entry and tell viewers to reset
    pub fn clear(&self) -> Result<()> {
        match &self.backend {
            Backend::Local(handle) => {
                handle.clear();
                Ok(())
            }
            Backend::Remote { runtime, remote } => runtime.block_on(remote.clear()),
        }
    }

    /// Block until every queued update has been handed to the viewers.
    ///
    /// Call this before the process exits; anything still queued at exit is
    /// lost.
    pub fn wait(&self) -> Result<()> {
        let limit = Duration::from_secs(self.config.wait_timeout_secs);
        match &self.backend {
            Backend::Local(handle) => {
                let poll = Duration::from_millis(self.config.wait_poll_ms);
                if handle.wait(poll, limit) {
                    Ok(())
                } else {
                    Err(VizError::Server(
                        "Pending entries were not delivered before the wait timeout".to_string(),
                    ))
                }
            }
            Backend::Remote { runtime, remote } => runtime.block_on(remote.wait(limit)),
        }
    }

    /// Current entries in first-seen order
    pub fn entries(&self) -> Result<Vec<Entry>> {
        match &self.backend {
            Backend::Local(handle) => Ok(handle.publisher().snapshot()),
            Backend::Remote { runtime, remote } => runtime.block_on(remote.entries()),
        }
    }

    /// Stop the embedded server, if this client owns one. Idempotent.
    pub fn shutdown(&self) {
        if let Backend::Local(handle) = &self.backend {
            handle.shutdown();
        }
    }

    fn send_view<T: Serialize>(&self, view: View, value: T, id: Option<&str>) -> Result<()> {
        let mut options = SendOptions::new().view(view.as_str());
        options.id = id.map(str::to_string);
        self.send_with(value, options)
    }

    /// Render as a table
    pub fn table<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Table, value, id)
    }

    /// Render as a collapsible JSON tree
    pub fn json<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Json, value, id)
    }

    /// Render as markdown
    pub fn markdown<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Markdown, value, id)
    }

    /// Render as a progress bar
    pub fn progress<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Progress, value, id)
    }

    /// Render as a pie chart
    pub fn pie<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Pie, value, id)
    }

    /// Render as a single number
    pub fn number<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Number, value, id)
    }

    /// Render as an area chart
    pub fn area<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Area, value, id)
    }

    /// Render as a bar chart
    pub fn bar<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Bar, value, id)
    }

    /// Render as a card
    pub fn card<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Card, value, id)
    }

    /// Render as a map location
    pub fn location<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Location, value, id)
    }

    /// Render the value as-is
    pub fn raw<T: Serialize>(&self, value: T, id: Option<&str>) -> Result<()> {
        self.send_view(View::Raw, value, id)
    }

    /// Append one timestamped line to a log.
    ///
    /// Repeated calls with the same `id` (default `"log"`) grow one entry.
    pub fn log(&self, values: &[Value], id: Option<&str>) -> Result<()> {
        let record = log_record(values)?;
        let options = SendOptions::new()
            .id(id.unwrap_or(DEFAULT_LOG_ID))
            .view(View::Log.as_str())
            .append(true);
        self.send_with(record, options)
    }

    /// Send the current call stack
    pub fn stack(&self, id: Option<&str>) -> Result<()> {
        let trace = Backtrace::force_capture().to_string();
        self.send_view(View::Stack, trace, id)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

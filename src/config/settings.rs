//! Configuration structures for VizStream

use crate::{Result, VizError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for every environment variable VizStream reads
pub const ENV_PREFIX: &str = "VIZSTREAM";

/// Port used when nothing else is configured
pub const DEFAULT_PORT: u16 = 5544;

/// Server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener settings
    pub server: ServerSettings,
    /// Dashboard asset location
    pub assets: AssetSettings,
    /// Size and time limits
    pub limits: LimitSettings,
}

/// Core server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub host: String,
    /// TCP port for both HTTP and WebSocket traffic (0 picks a free port)
    pub port: u16,
    /// Print the dashboard URL once the listener is up
    pub show_url: bool,
    /// Bytes read from a new connection to classify it
    pub read_chunk_size: usize,
    /// Idle time after which a viewer is treated as disconnected
    pub ws_read_timeout_secs: u64,
}

/// Dashboard build directory settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    /// Directory holding `index.html` and the static assets it loads
    pub dist_path: PathBuf,
}

/// Request and frame limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Largest accepted HTTP request head
    pub max_head_bytes: usize,
    /// Largest accepted HTTP request body
    pub max_body_bytes: usize,
    /// Largest accepted inbound WebSocket frame payload
    pub max_frame_bytes: usize,
    /// Upper bound for `GET /api/wait`
    pub wait_timeout_secs: u64,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host used to probe for and talk to an existing server
    pub host: String,
    /// Server port
    pub port: u16,
    /// Print the dashboard URL when this client starts the server
    pub show_url: bool,
    /// Liveness probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Timeout for forwarded requests in milliseconds
    pub request_timeout_ms: u64,
    /// Poll interval while waiting for the pending queue to drain
    pub wait_poll_ms: u64,
    /// Give up waiting for the pending queue after this many seconds
    pub wait_timeout_secs: u64,
    /// Dashboard build directory for a server started by this client
    pub dist_path: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            show_url: true,
            read_chunk_size: 1024,
            ws_read_timeout_secs: 30,
        }
    }
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            dist_path: PathBuf::from("client_build"),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 16 * 1024 * 1024,
            wait_timeout_secs: 600,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            show_url: true,
            probe_timeout_ms: 1000,
            request_timeout_ms: 5000,
            wait_poll_ms: 10,
            wait_timeout_secs: 600,
            dist_path: None,
        }
    }
}

/// Short-form variables (`VIZSTREAM_PORT`, `VIZSTREAM_SHOW_URL`,
/// `VIZSTREAM_DIST_PATH`) that apply to the server as well as the client
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvShortcuts {
    port: Option<u16>,
    show_url: Option<bool>,
    dist_path: Option<PathBuf>,
}

impl EnvShortcuts {
    fn from_env() -> Result<Self> {
        let shortcuts = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(shortcuts)
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VizError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| VizError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, an optional TOML file and `VIZSTREAM_*` environment
    /// variables, in that order.
    ///
    /// Nested keys use a double underscore (`VIZSTREAM_SERVER__PORT`); the
    /// short forms `VIZSTREAM_PORT`, `VIZSTREAM_SHOW_URL` and
    /// `VIZSTREAM_DIST_PATH` win over both.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let mut config: ServerConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        let shortcuts = EnvShortcuts::from_env()?;
        if let Some(port) = shortcuts.port {
            config.server.port = port;
        }
        if let Some(show_url) = shortcuts.show_url {
            config.server.show_url = show_url;
        }
        if let Some(dist_path) = shortcuts.dist_path {
            config.assets.dist_path = dist_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(VizError::Config("Host cannot be empty".to_string()));
        }
        if self.server.read_chunk_size == 0 {
            return Err(VizError::Config("Read chunk size must be positive".to_string()));
        }
        if self.server.ws_read_timeout_secs == 0 {
            return Err(VizError::Config(
                "WebSocket read timeout must be positive".to_string(),
            ));
        }
        if self.limits.max_head_bytes < self.server.read_chunk_size {
            return Err(VizError::Config(
                "Maximum head size must be at least the read chunk size".to_string(),
            ));
        }
        if self.limits.max_frame_bytes == 0 {
            return Err(VizError::Config("Maximum frame size must be positive".to_string()));
        }
        Ok(())
    }

    /// Address string handed to the listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Viewer read timeout as a duration
    pub fn ws_read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.ws_read_timeout_secs)
    }
}

impl ClientConfig {
    /// Defaults overridden by `VIZSTREAM_*` environment variables
    /// (`VIZSTREAM_PORT`, `VIZSTREAM_HOST`, `VIZSTREAM_SHOW_URL`, ...)
    pub fn load() -> Result<Self> {
        let config: ClientConfig = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(VizError::Config("Host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(VizError::Config("Client port cannot be 0".to_string()));
        }
        if self.probe_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(VizError::Config("Timeouts must be positive".to_string()));
        }
        if self.wait_poll_ms == 0 {
            return Err(VizError::Config("Wait poll interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Configuration for a server started on behalf of this client.
    ///
    /// The client prints the URL itself, so the server stays quiet.
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.port = self.port;
        config.server.show_url = false;
        config.limits.wait_timeout_secs = self.wait_timeout_secs;
        if let Some(dist_path) = &self.dist_path {
            config.assets.dist_path = dist_path.clone();
        }
        config
    }

    /// Address used for the probe and forwarded requests
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

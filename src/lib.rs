//! # VizStream - Live Dashboards for Running Processes
//!
//! VizStream embeds a small local server in your process. You "send" a value
//! under an identifier and a view hint; the server keeps the latest value per
//! identifier and pushes every update to connected browser dashboards over a
//! WebSocket.
//!
//! ## Features
//!
//! - **Embedded**: HTTP and WebSocket multiplexed on one TCP port, no framework
//! - **Thread-Safe**: call the client from any thread; updates are handed to a
//!   single I/O loop in order
//! - **Append Merge**: grow strings, lists and log records in place
//! - **Attach Mode**: a second client on the same port forwards over HTTP
//!   instead of binding a new listener
//!
//! ## Quick Start
//!
//! ### Embedded client
//! ```no_run
//! use vizstream::client::Client;
//! use serde_json::json;
//!
//! fn main() -> vizstream::Result<()> {
//!     let viz = Client::new()?;
//!
//!     viz.table(json!([{"name": "alpha", "score": 3}]), Some("scores"))?;
//!     viz.log(&[json!("starting run"), json!(42)], None)?;
//!
//!     // Block until every viewer has been sent the buffered updates
//!     viz.wait()?;
//!     Ok(())
//! }
//! ```
//!
//! ### Standalone server
//! ```no_run
//! use vizstream::config::ServerConfig;
//! use vizstream::server::VizServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load(None)?;
//!     let server = VizServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod server;
pub mod types;

/// Common error types used throughout VizStream
pub mod error {
    use std::fmt;

    /// VizStream error types
    #[derive(Debug)]
    pub enum VizError {
        /// I/O operation failed
        Io(std::io::Error),
        /// Serialization/deserialization failed
        Serde(serde_json::Error),
        /// Configuration error
        Config(String),
        /// Server error
        Server(String),
        /// The listener could not bind its address
        Bind(String),
        /// Client error
        Client(String),
        /// Connection error
        Connection(String),
        /// Malformed HTTP or WebSocket traffic
        Protocol(String),
    }

    impl fmt::Display for VizError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                VizError::Io(e) => write!(f, "I/O error: {}", e),
                VizError::Serde(e) => write!(f, "Serialization error: {}", e),
                VizError::Config(e) => write!(f, "Configuration error: {}", e),
                VizError::Server(e) => write!(f, "Server error: {}", e),
                VizError::Bind(e) => write!(f, "Bind error: {}", e),
                VizError::Client(e) => write!(f, "Client error: {}", e),
                VizError::Connection(e) => write!(f, "Connection error: {}", e),
                VizError::Protocol(e) => write!(f, "Protocol error: {}", e),
            }
        }
    }

    impl std::error::Error for VizError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                VizError::Io(e) => Some(e),
                VizError::Serde(e) => Some(e),
                _ => None,
            }
        }
    }

    impl From<std::io::Error> for VizError {
        fn from(err: std::io::Error) -> Self {
            VizError::Io(err)
        }
    }

    impl From<serde_json::Error> for VizError {
        fn from(err: serde_json::Error) -> Self {
            VizError::Serde(err)
        }
    }

    impl From<::config::ConfigError> for VizError {
        fn from(err: ::config::ConfigError) -> Self {
            VizError::Config(err.to_string())
        }
    }

    /// Result type alias for VizStream operations
    pub type Result<T> = std::result::Result<T, VizError>;
}

pub use error::{Result, VizError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{Client, SendOptions};
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::server::{ServerHandle, VizServer};
    pub use crate::types::{Entry, SendRequest};
    pub use crate::{Result, VizError};
}

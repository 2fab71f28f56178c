//! Configuration management for VizStream

pub mod settings;

pub use settings::{
    AssetSettings, ClientConfig, LimitSettings, ServerConfig, ServerSettings, DEFAULT_PORT,
    ENV_PREFIX,
};

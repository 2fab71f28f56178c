//! VizStream client implementation

pub mod facade;
pub mod remote;

pub use facade::{Client, SendOptions};
pub use remote::{probe_running, RemoteServer};

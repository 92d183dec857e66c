//! Configuration system for the Ashfall transport.
//!
//! Settings persist to disk as RON files. Every section falls back to its
//! defaults when missing, so older files keep loading after new fields land.

mod config;
mod error;

pub use config::{
    ClientConfig, CompressionConfig, Config, LogConfig, ReconnectConfig, ServerConfig,
    WebSocketConfig,
};
pub use error::ConfigError;

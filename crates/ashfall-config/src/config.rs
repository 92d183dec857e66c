//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub log: LogConfig,
    /// Inbound TCP server settings.
    pub server: ServerConfig,
    /// Inbound WebSocket server settings.
    pub websocket: WebSocketConfig,
    /// Outbound TCP client settings.
    pub client: ClientConfig,
    /// Payload compression, shared by every transport.
    pub compression: CompressionConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "debug,ashfall_net=trace"). `RUST_LOG` wins when set.
    pub level: String,
    /// Also write JSON lines to `log_dir/ashfall.log`.
    pub json_file: bool,
    /// Directory for the JSON log file.
    pub log_dir: Option<String>,
}

/// TCP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, `host:port`.
    pub addr: String,
    /// Remote IPs allowed to connect. Empty or containing `0.0.0.0` allows everyone.
    pub allowed_ips: Vec<String>,
    /// Maximum live connections (0 = unlimited).
    pub max_connections: u32,
    /// Require a handshake message before any other traffic.
    pub handshake_enable: bool,
    /// Seconds without any inbound message before a connection is dropped.
    pub idle_timeout_secs: u64,
    /// Upper bound on how long `stop` waits for connection tasks.
    pub shutdown_timeout_secs: u64,
    /// Largest accepted frame body (type + flags + payload) in bytes.
    pub max_frame_size: u32,
}

/// WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Listen address, `host:port`.
    pub addr: String,
    /// HTTP path that accepts the upgrade.
    pub path: String,
    pub allowed_ips: Vec<String>,
    pub max_connections: u32,
    /// Require a handshake message right after the upgrade.
    pub handshake_enable: bool,
    pub idle_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub max_frame_size: u32,
}

/// Outbound TCP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Dial timeout for every connect attempt, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Reconnect automatically after a failed connect or a lost connection.
    pub enable_reconnect: bool,
    /// Interval between heartbeat pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Bound on a single handler invocation, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Bound on `close` waiting for background tasks, in milliseconds.
    pub close_timeout_ms: u64,
    pub max_frame_size: u32,
    /// Backoff policy.
    pub reconnect: ReconnectConfig,
}

/// Reconnect backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_retries: u32,
    /// Random spread applied to each delay, 0.0 to 1.0.
    pub jitter: f64,
}

/// Payload compression configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Payloads shorter than this are never compressed.
    pub min_size: usize,
    /// zstd level used for payloads above `fast_threshold`.
    pub compression_level: i32,
    /// Compressed output is kept only when smaller than `original * ratio`.
    pub compression_ratio: f64,
    /// Payloads up to this size use the fast level.
    pub fast_threshold: usize,
    /// Refuse to inflate a frame beyond this many bytes.
    pub max_decompressed_size: usize,
}

// --- Default implementations ---

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info,tungstenite=warn,tokio_tungstenite=warn".to_string(),
            json_file: false,
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:7777".to_string(),
            allowed_ips: Vec::new(),
            max_connections: 10_000,
            handshake_enable: false,
            idle_timeout_secs: 60,
            shutdown_timeout_secs: 10,
            max_frame_size: 1_048_576,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:7778".to_string(),
            path: "/ws".to_string(),
            allowed_ips: Vec::new(),
            max_connections: 10_000,
            handshake_enable: false,
            idle_timeout_secs: 60,
            shutdown_timeout_secs: 10,
            max_frame_size: 1_048_576,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            enable_reconnect: true,
            heartbeat_interval_ms: 5_000,
            handler_timeout_ms: 10_000,
            close_timeout_ms: 10_000,
            max_frame_size: 1_048_576,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            multiplier: 1.5,
            max_retries: 0,
            jitter: 0.0,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1024,
            compression_level: 3,
            compression_ratio: 0.9,
            fast_threshold: 8 * 1024,
            max_decompressed_size: 16 * 1024 * 1024,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(config_dir)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read `config.ron`: returns `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(config_dir)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.compression;
        if !(c.compression_ratio > 0.0 && c.compression_ratio <= 1.0) {
            return Err(invalid(
                "compression.compression_ratio",
                format!("{} is not in (0, 1]", c.compression_ratio),
            ));
        }
        if !(1..=22).contains(&c.compression_level) {
            return Err(invalid(
                "compression.compression_level",
                format!("{} is not a zstd level (1..=22)", c.compression_level),
            ));
        }

        let r = &self.client.reconnect;
        if r.multiplier < 1.0 {
            return Err(invalid(
                "client.reconnect.multiplier",
                format!("{} would shrink the backoff", r.multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return Err(invalid(
                "client.reconnect.jitter",
                format!("{} is not in [0, 1]", r.jitter),
            ));
        }
        if r.initial_interval_ms > r.max_interval_ms {
            return Err(invalid(
                "client.reconnect.initial_interval_ms",
                "greater than max_interval_ms".to_string(),
            ));
        }
        if self.client.heartbeat_interval_ms == 0 {
            return Err(invalid(
                "client.heartbeat_interval_ms",
                "must be non-zero".to_string(),
            ));
        }

        if !self.websocket.path.starts_with('/') {
            return Err(invalid(
                "websocket.path",
                format!("{:?} must start with '/'", self.websocket.path),
            ));
        }
        for (field, size) in [
            ("server.max_frame_size", self.server.max_frame_size),
            ("websocket.max_frame_size", self.websocket.max_frame_size),
            ("client.max_frame_size", self.client.max_frame_size),
        ] {
            if size < 2 {
                return Err(invalid(field, format!("{size} cannot hold a frame header")));
            }
        }

        Ok(())
    }

    fn read(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

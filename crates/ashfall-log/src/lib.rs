//! Structured logging for Ashfall services.
//!
//! Installs a `tracing` subscriber with a human-readable console layer and an
//! optional JSON file layer. The filter comes from `RUST_LOG` when set, then
//! from [`LogConfig::level`], then from [`DEFAULT_FILTER`].

use std::fs::File;
use std::path::{Path, PathBuf};

use ashfall_config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config provide one.
/// WebSocket internals are noisy at `info`, so they start at `warn`.
pub const DEFAULT_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn";

/// File name of the JSON log inside the configured log directory.
pub const LOG_FILE_NAME: &str = "ashfall.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log; overrides [`LogConfig::log_dir`]
/// * `config` - log settings; `None` uses [`LogConfig::default`]
///
/// Calling this twice in one process is a no-op for the second call.
///
/// ```no_run
/// use ashfall_config::LogConfig;
/// use ashfall_log::init_logging;
///
/// init_logging(None, None);
///
/// let config = LogConfig { json_file: true, ..Default::default() };
/// init_logging(Some(std::path::Path::new("./logs")), Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, config: Option<&LogConfig>) {
    let default_config = LogConfig::default();
    let config = config.unwrap_or(&default_config);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(log_file) = open_log_file(log_dir, config) {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// Create an `EnvFilter` from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn filter_directive(config: &LogConfig) -> &str {
    if config.level.trim().is_empty() {
        DEFAULT_FILTER
    } else {
        &config.level
    }
}

/// Resolve and create the JSON log file, if one is wanted.
fn open_log_file(log_dir: Option<&Path>, config: &LogConfig) -> Option<File> {
    if !config.json_file {
        return None;
    }
    let dir = log_dir
        .map(Path::to_path_buf)
        .or_else(|| config.log_dir.as_ref().map(PathBuf::from))?;

    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("cannot create log dir {}: {e}", dir.display());
        return None;
    }
    match File::create(dir.join(LOG_FILE_NAME)) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("cannot create log file in {}: {e}", dir.display());
            None
        }
    }
}

// src/logging.rs

//! Tracing setup for the binary. The library only emits events; installing a
//! subscriber is left to whoever embeds it.

use std::fs::OpenOptions;
use std::path::PathBuf;

use color_eyre::eyre::{Result, WrapErr};
use directories::ProjectDirs;
use lazy_static::lazy_static;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    static ref APP_PREFIX: String = env!("CARGO_CRATE_NAME").to_uppercase();
    /// Level override, e.g. `RECONFLOW_LOGLEVEL=debug`.
    pub static ref LOG_ENV: String = format!("{}_LOGLEVEL", *APP_PREFIX);
    /// Directory override for the log file.
    pub static ref DATA_ENV: String = format!("{}_DATA", *APP_PREFIX);
    pub static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
}

/// Where the log file lives: `$RECONFLOW_DATA`, else the platform's local data dir.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_ENV.as_str()) {
        return PathBuf::from(dir);
    }
    ProjectDirs::from("com", "reconflow", env!("CARGO_PKG_NAME"))
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".").join(".data"))
}

/// Filter directive from `RUST_LOG`, then `RECONFLOW_LOGLEVEL`, then `reconflow=info`.
pub fn log_level() -> String {
    let from_env = std::env::var("RUST_LOG").or_else(|_| std::env::var(LOG_ENV.as_str()));
    directive(from_env.ok())
}

fn directive(level: Option<String>) -> String {
    match level {
        Some(level) if !level.trim().is_empty() => level,
        _ => format!("{}=info", env!("CARGO_CRATE_NAME")),
    }
}

/// Installs the global subscriber: an appending log file, plus a stderr
/// layer when `verbose` is set. Returns the log file path.
pub fn initialize_logging(verbose: bool) -> Result<PathBuf> {
    let directory = data_dir();
    std::fs::create_dir_all(&directory)
        .wrap_err_with(|| format!("cannot create log directory {}", directory.display()))?;
    let log_path = directory.join(LOG_FILE.as_str());
    let log_file = OpenOptions::new().create(true).append(true).open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level()));

    let console_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(EnvFilter::new(log_level()))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(ErrorLayer::default())
        .init();

    Ok(log_path)
}

//! Tracing setup for the daemon binary.
//!
//! Logs never go to stdout: in `run` mode stdout carries session output.

use std::fs::OpenOptions;
use std::io;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

/// Keeps the background log writer alive. Dropping it flushes pending lines.
#[must_use = "logs written after the guard is dropped may be lost"]
pub struct LogGuard {
    _writer: Option<WorkerGuard>,
}

/// The filter directive used when `RUST_LOG` is not set.
pub fn default_directive(config: &DaemonConfig, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        config.log_level.to_lowercase()
    }
}

fn env_filter(config: &DaemonConfig, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config, verbose)))
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `--verbose`, which takes precedence over
/// `daemon.log_level`.
pub fn init(config: &DaemonConfig, verbose: bool) -> Result<LogGuard> {
    let filter = env_filter(config, verbose);

    match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

            Ok(LogGuard {
                _writer: Some(guard),
            })
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

            Ok(LogGuard { _writer: None })
        }
    }
}

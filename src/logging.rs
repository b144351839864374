//! Logger setup. Every event becomes exactly one line; the file writer sits
//! behind a mutex so concurrent transformer threads never interleave.

use anyhow::Result;
use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
/// Without a usable log file, output goes to stderr.
pub fn init(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let opened = log_file.map(|p| OpenOptions::new().create(true).append(true).open(p));
    let installed = match opened {
        Some(Ok(file)) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        Some(Err(e)) => {
            let installed = builder.with_writer(std::io::stderr).try_init();
            if let Some(path) = log_file {
                warn!("Failed to log to file {}: {e}", path.display());
            }
            installed
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_filter_directives() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Debug.directive(), "debug");
        assert_eq!(LogLevel::Error.directive(), "error");
        assert!(EnvFilter::try_new(LogLevel::Warn.directive()).is_ok());
    }
}

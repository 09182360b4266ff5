//! Tracing subscriber setup.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Keeps the background log writer alive. Drop it last.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Build the filter from the configured level, `verbose` forcing debug.
pub fn build_filter(level: &str, verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, writing to `log_file` when given and to
/// stderr otherwise.
pub fn init(level: &str, verbose: bool, log_file: Option<&Path>) -> Result<LogGuard> {
    let filter = build_filter(level, verbose);

    let Some(log_file) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        return Ok(LogGuard { _worker: None });
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", log_file.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(LogGuard {
        _worker: Some(guard),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_uses_configured_level() {
        assert_eq!(build_filter("warn", false).to_string(), "warn");
    }

    #[test]
    fn test_verbose_forces_debug() {
        assert_eq!(build_filter("error", true).to_string(), "debug");
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        assert_eq!(build_filter("hideaway=loud", false).to_string(), "info");
    }
}

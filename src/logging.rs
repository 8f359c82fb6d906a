//! Logging Module
//!
//! Application logging through `tracing`: a compact console layer plus an
//! optional daily-rotated log file.

use crate::config::LoggingConfig;
use crate::{CacheError, Result};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "mdcache.log";

/// Logger manager for the application log
pub struct LoggerManager {
    pub config: LoggingConfig,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Initialize the logging system
    pub fn initialize(&mut self) -> Result<()> {
        self.setup_application_logging()?;
        info!("Logging system initialized");
        Ok(())
    }

    fn env_filter(&self) -> EnvFilter {
        // RUST_LOG wins over the configured level
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.log_level))
    }

    fn setup_application_logging(&self) -> Result<()> {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let file_layer = if self.config.file_logging {
            std::fs::create_dir_all(&self.config.log_dir).map_err(|e| {
                CacheError::IoError(format!("Failed to create log directory: {}", e))
            })?;
            let file_appender = RollingFileAppender::new(
                Rotation::DAILY,
                self.config.log_dir.clone(),
                LOG_FILE_PREFIX,
            );
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        } else {
            None
        };

        let result = tracing_subscriber::registry()
            .with(self.env_filter())
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                if self.config.file_logging {
                    info!("Application logs will be written to: {:?}", self.config.log_dir);
                }
            }
            Err(_) => {
                // already initialized, as in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }
        Ok(())
    }

    /// Remove rotated log files older than `keep_days`. Returns how many were removed.
    pub fn cleanup_old_logs(&self, keep_days: u32) -> Result<usize> {
        let max_age = Duration::from_secs(u64::from(keep_days) * 24 * 3600);
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        remove_logs_older_than(&self.config.log_dir, cutoff)
    }
}

fn remove_logs_older_than(dir: &Path, cutoff: SystemTime) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !is_log {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed old log file: {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}

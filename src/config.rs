//! Configuration Module
//!
//! Handles configuration loading from YAML files, environment variables,
//! and command-line arguments.

use crate::auto_resize::AutoResizeConfig;
use crate::cache::MetadataCacheConfig;
use crate::cache_image::ImageConfig;
use crate::coordination::{CoordinationConfig, WriteStrategy};
use crate::{CacheError, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auto_resize: AutoResizeConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_size() -> u64 {
    1024 * 1024
}

fn default_min_clean_size() -> u64 {
    512 * 1024
}

fn default_evictions_enabled() -> bool {
    true
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./mdcache.dat")
}

/// Cache sizing and open mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cache size in bytes; superseded by `auto_resize.initial_size`
    /// when adaptive resizing is on
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_min_clean_size")]
    pub min_clean_size: u64,
    #[serde(default = "default_evictions_enabled")]
    pub evictions_enabled: bool,
    #[serde(default)]
    pub read_only: bool,
    /// Backing file used by the file storage
    #[serde(
        default = "default_storage_path",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub storage_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            min_clean_size: default_min_clean_size(),
            evictions_enabled: default_evictions_enabled(),
            read_only: false,
            storage_path: default_storage_path(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than zero".to_string());
        }
        if self.min_clean_size > self.max_size {
            return Err(format!(
                "min_clean_size {} exceeds max_size {}",
                self.min_clean_size, self.max_size
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(
        default = "default_log_dir",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub log_dir: PathBuf,
    /// Also write a daily-rotated log file under `log_dir`
    #[serde(default)]
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            file_logging: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LoggingConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "log_level must be one of {:?}, got {}",
                LOG_LEVELS, self.log_level
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Build configuration from already-parsed command-line arguments
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::load_from_file(Path::new(path))?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(matches);
        config.validate()?;

        debug!(
            "Configuration: max_size={} min_clean_size={} read_only={} strategy={:?}",
            config.cache.max_size,
            config.cache.min_clean_size,
            config.cache.read_only,
            config.coordination.strategy
        );
        Ok(config)
    }

    pub fn build_cli() -> Command {
        Command::new("mdcache")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Metadata cache with coordinated multi-process writes and cache images")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .global(true)
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .global(true)
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("max-size")
                    .long("max-size")
                    .value_name("BYTES")
                    .global(true)
                    .help("Maximum cache size in bytes"),
            )
            .arg(
                Arg::new("read-only")
                    .long("read-only")
                    .action(ArgAction::SetTrue)
                    .global(true)
                    .help("Open the cache read-only"),
            )
            .subcommand(
                Command::new("simulate")
                    .about("Run a coordinated workload over simulated processes")
                    .arg(
                        Arg::new("processes")
                            .short('n')
                            .long("processes")
                            .value_name("COUNT")
                            .help("Number of simulated processes"),
                    )
                    .arg(
                        Arg::new("strategy")
                            .long("strategy")
                            .value_name("STRATEGY")
                            .value_parser(["process_zero_only", "distributed"])
                            .help("Write strategy"),
                    )
                    .arg(
                        Arg::new("entries")
                            .long("entries")
                            .value_name("COUNT")
                            .default_value("64")
                            .help("Entries each process inserts"),
                    )
                    .arg(
                        Arg::new("entry-size")
                            .long("entry-size")
                            .value_name("BYTES")
                            .default_value("512")
                            .help("Size of each entry"),
                    )
                    .arg(
                        Arg::new("image-out")
                            .long("image-out")
                            .value_name("FILE")
                            .help("Write the close-time cache image to this file"),
                    ),
            )
            .subcommand(
                Command::new("inspect")
                    .about("Validate and summarize a cache image file")
                    .arg(
                        Arg::new("file")
                            .value_name("FILE")
                            .required(true)
                            .help("Image file to read"),
                    )
                    .arg(
                        Arg::new("json")
                            .long("json")
                            .action(ArgAction::SetTrue)
                            .help("Print the summary as JSON"),
                    ),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            CacheError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        info!("Configuration loaded from file: {}", path.display());
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MDCACHE_MAX_SIZE") {
            match value.parse() {
                Ok(size) => self.cache.max_size = size,
                Err(_) => warn!("Ignoring MDCACHE_MAX_SIZE={}: not a number", value),
            }
        }

        if let Ok(value) = std::env::var("MDCACHE_MIN_CLEAN_SIZE") {
            match value.parse() {
                Ok(size) => self.cache.min_clean_size = size,
                Err(_) => warn!("Ignoring MDCACHE_MIN_CLEAN_SIZE={}: not a number", value),
            }
        }

        if let Ok(value) = std::env::var("MDCACHE_READ_ONLY") {
            self.cache.read_only = parse_bool(&value);
        }

        if let Ok(path) = std::env::var("MDCACHE_STORAGE_PATH") {
            self.cache.storage_path = pathbuf_serde::expand_tilde(&path);
        }

        if let Ok(value) = std::env::var("MDCACHE_WRITE_STRATEGY") {
            match value.to_lowercase().as_str() {
                "process_zero_only" | "p0" => {
                    self.coordination.strategy = WriteStrategy::ProcessZeroOnly
                }
                "distributed" => self.coordination.strategy = WriteStrategy::Distributed,
                other => warn!("Ignoring unknown MDCACHE_WRITE_STRATEGY={}", other),
            }
        }

        if let Ok(value) = std::env::var("MDCACHE_DIRTY_BYTES_THRESHOLD") {
            if let Ok(threshold) = value.parse() {
                self.coordination.dirty_bytes_threshold = threshold;
            }
        }

        if let Ok(value) = std::env::var("MDCACHE_PROCESS_COUNT") {
            if let Ok(count) = value.parse() {
                self.coordination.process_count = count;
            }
        }

        if let Ok(value) = std::env::var("MDCACHE_GENERATE_IMAGE") {
            self.image.generate_image = parse_bool(&value);
        }

        if let Ok(level) = std::env::var("MDCACHE_LOG_LEVEL") {
            self.logging.log_level = level;
        }

        if let Ok(dir) = std::env::var("MDCACHE_LOG_DIR") {
            self.logging.log_dir = pathbuf_serde::expand_tilde(&dir);
            self.logging.file_logging = true;
        }
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
        if let Some(value) = matches.get_one::<String>("max-size") {
            match value.parse() {
                Ok(size) => self.cache.max_size = size,
                Err(_) => warn!("Ignoring --max-size {}: not a number", value),
            }
        }
        if matches.get_flag("read-only") {
            self.cache.read_only = true;
        }
        if let Some(("simulate", sub)) = matches.subcommand() {
            if let Some(count) = sub
                .get_one::<String>("processes")
                .and_then(|v| v.parse().ok())
            {
                self.coordination.process_count = count;
            }
            match sub.get_one::<String>("strategy").map(String::as_str) {
                Some("process_zero_only") => {
                    self.coordination.strategy = WriteStrategy::ProcessZeroOnly
                }
                Some("distributed") => self.coordination.strategy = WriteStrategy::Distributed,
                _ => {}
            }
            if sub.get_one::<String>("image-out").is_some() {
                self.image.generate_image = true;
            }
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        let sections: [(&str, std::result::Result<(), String>); 5] = [
            ("cache", self.cache.validate()),
            ("auto_resize", self.auto_resize.validate()),
            ("coordination", self.coordination.validate()),
            ("image", self.image.validate()),
            ("logging", self.logging.validate()),
        ];
        for (name, outcome) in sections {
            if let Err(e) = outcome {
                return Err(CacheError::ConfigError(format!(
                    "Invalid {} configuration: {}",
                    name, e
                )));
            }
        }
        if !self.cache.evictions_enabled && self.auto_resize.is_enabled() {
            return Err(CacheError::ConfigError(
                "Invalid cache configuration: automatic resizing requires evictions".to_string(),
            ));
        }
        if self.cache.read_only && self.image.generate_image {
            warn!("generate_image has no effect on a read-only cache");
        }
        Ok(())
    }

    /// Settings for `MetadataCache::new`
    pub fn to_cache_config(&self) -> MetadataCacheConfig {
        MetadataCacheConfig {
            max_size: self.cache.max_size,
            min_clean_size: self.cache.min_clean_size,
            evictions_enabled: self.cache.evictions_enabled,
            read_only: self.cache.read_only,
            auto_resize: self.auto_resize.clone(),
            image: self.image.clone(),
        }
    }
}

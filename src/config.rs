//! Stack configuration management via TOML files.
//!
//! Parses worker pool and logging settings with sensible defaults; missing
//! sections fall back to [`StackConfig::default`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use toml::Value;

/// Configuration for the parallel engine and the operation log.
///
/// # Examples
///
/// ```
/// use image_stack::StackConfig;
///
/// let config = StackConfig::from_str("[parallel]\nn_workers = 2").unwrap();
/// assert_eq!(config.n_workers, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackConfig {
    /// Number of workers used by `apply`/`transform`
    pub n_workers: usize,
    /// Report block progress through `tracing`
    pub verbose: bool,
    /// Destination of the JSON line operation log, if any
    pub log_path: Option<PathBuf>,
}

impl StackConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let value: Value =
            toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let parallel = value
            .get("parallel")
            .and_then(|v| v.as_table())
            .cloned()
            .unwrap_or_default();

        let n_workers = match parallel.get("n_workers") {
            None => default_workers(),
            Some(v) => {
                let n = v
                    .as_integer()
                    .ok_or_else(|| ConfigError::Parse("n_workers must be an integer".into()))?;
                if n < 1 {
                    return Err(ConfigError::Parse("n_workers must be at least 1".into()));
                }
                n as usize
            }
        };

        let verbose = parallel
            .get("verbose")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let log_path = value
            .get("logging")
            .and_then(|v| v.get("path"))
            .and_then(|v| v.as_str())
            .map(PathBuf::from);

        Ok(Self {
            n_workers,
            verbose,
            log_path,
        })
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            n_workers: default_workers(),
            verbose: false,
            log_path: None,
        }
    }
}

/// Available CPU count, or 1 when it cannot be determined.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "IO error: {}", err),
            ConfigError::Parse(err) => write!(f, "Parse error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

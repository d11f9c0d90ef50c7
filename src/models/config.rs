//! Configuration models for tristream.
//!
//! Values come from an optional TOML file, then environment overrides.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Environment variable overriding `coordinator.concurrency`.
pub const ENV_CONCURRENCY: &str = "TRISTREAM_CONCURRENCY";
/// Environment variable overriding `coordinator.checkpoint_dir`.
pub const ENV_CHECKPOINT_DIR: &str = "TRISTREAM_CHECKPOINT_DIR";
/// Environment variable overriding `coordinator.staging_root`.
pub const ENV_STAGING_ROOT: &str = "TRISTREAM_STAGING_ROOT";
/// Environment variable overriding `store.root`.
pub const ENV_STORE_ROOT: &str = "TRISTREAM_STORE_ROOT";

/// Top-level configuration for tristream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Local store settings (used by the bundled filesystem processors)
    #[serde(default)]
    pub store: StoreConfig,
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum transactions in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Directory holding one checkpoint file per record
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Root of per-record staging directories
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,

    /// Timeout for any single prepare/commit/rollback call
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,

    /// Attempts per stream commit (1 = no retry)
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,

    /// Draw a progress bar during batch runs
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_concurrency() -> usize {
    4
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/tmp/tristream/checkpoints")
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("/tmp/tristream/staging")
}

fn default_stream_timeout() -> u64 {
    180
}

fn default_commit_attempts() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            checkpoint_dir: default_checkpoint_dir(),
            staging_root: default_staging_root(),
            stream_timeout_secs: default_stream_timeout(),
            commit_attempts: default_commit_attempts(),
            show_progress: true,
        }
    }
}

impl CoordinatorConfig {
    /// Config rooted under one directory, for tests and dry runs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            checkpoint_dir: root.join("checkpoints"),
            staging_root: root.join("staging"),
            show_progress: false,
            ..Default::default()
        }
    }

    pub fn stream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stream_timeout_secs)
    }
}

/// Filesystem store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory; each stream writes under `<root>/<stream>/`
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/tmp/tristream/store")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Load from `path` if it exists (defaults otherwise), apply the
    /// environment, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup and expand `${VAR}` in paths.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_CONCURRENCY) {
            self.coordinator.concurrency =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: ENV_CONCURRENCY.to_string(),
                    value: raw.clone(),
                })?;
        }
        if let Some(dir) = lookup(ENV_CHECKPOINT_DIR) {
            self.coordinator.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_STAGING_ROOT) {
            self.coordinator.staging_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_STORE_ROOT) {
            self.store.root = PathBuf::from(dir);
        }

        self.coordinator.checkpoint_dir = expand_path(&self.coordinator.checkpoint_dir, &lookup);
        self.coordinator.staging_root = expand_path(&self.coordinator.staging_root, &lookup);
        self.store.root = expand_path(&self.store.root, &lookup);
        Ok(())
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "coordinator.concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        if self.coordinator.commit_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "coordinator.commit_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        if self.coordinator.stream_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "coordinator.stream_timeout_secs".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = s.to_string();
    for cap in ENV_PLACEHOLDER.captures_iter(s) {
        if let Some(value) = lookup(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

fn expand_path<F>(path: &Path, lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    let raw = path.to_string_lossy();
    if !raw.contains("${") {
        return path.to_path_buf();
    }
    PathBuf::from(expand_env_vars(&raw, lookup))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: String, value: String },
}

//! Runtime configuration
//!
//! Sources, lowest priority first: built-in defaults, a `retainer.toml`
//! file, then `RETAINER_*` environment variables. The result is installed
//! once per process; the first read without an explicit install discovers
//! it from the working directory and environment.

use crate::error::ConfigError;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_FILE_NAME: &str = "retainer.toml";
pub const MAX_SIDE_TABLE_SHARDS: usize = 4096;

static CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub refcount: RefcountConfig,

    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefcountConfig {
    /// Keep every count in the side table instead of the header word
    #[serde(default = "default_false")]
    pub disable_inline_metadata: bool,

    #[serde(default = "default_shards")]
    pub side_table_shards: usize,

    #[serde(default = "default_true")]
    pub warn_on_pool_leak: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub json: bool,

    /// Directory for daily-rolling log files; stderr when unset
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default = "default_false")]
    pub spans: bool,
}

impl Default for RefcountConfig {
    fn default() -> Self {
        Self {
            disable_inline_metadata: false,
            side_table_shards: default_shards(),
            warn_on_pool_leak: true,
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
            spans: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_shards() -> usize { 64 }
fn default_level() -> String { "warn".to_string() }

impl RuntimeConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Self::parse(&content)
    }

    /// Parse and validate TOML content
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Find `retainer.toml` in the current directory or any parent
    pub fn discover() -> Self {
        let mut current = std::env::current_dir().ok();

        while let Some(dir) = current {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                match Self::load(&config_path) {
                    Ok(config) => {
                        debug!(path = %config_path.display(), "loaded runtime config");
                        return config;
                    }
                    Err(e) => warn!(error = %e, "ignoring unusable runtime config"),
                }
            }

            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default()
    }

    /// Defaults, then a discovered file, then environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::discover();
        if let Err(e) = config.apply_env() {
            warn!(error = %e, "ignoring invalid environment override");
        }
        config
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `RETAINER_*` overrides from `lookup`.
    ///
    /// The config is left untouched when any override is invalid.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let mut next = self.clone();

        if let Some(value) = lookup("RETAINER_DISABLE_INLINE_METADATA") {
            next.refcount.disable_inline_metadata = parse_flag(&value).ok_or_else(|| {
                ConfigError::Invalid {
                    field: "disable_inline_metadata",
                    reason: format!("expected a boolean, got '{}'", value),
                }
            })?;
        }

        if let Some(value) = lookup("RETAINER_SIDE_TABLE_SHARDS") {
            next.refcount.side_table_shards =
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    field: "side_table_shards",
                    reason: format!("expected an integer, got '{}'", value),
                })?;
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let shards = self.refcount.side_table_shards;
        if shards == 0 || shards > MAX_SIDE_TABLE_SHARDS || !shards.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "side_table_shards",
                reason: format!(
                    "{} is not a power of two between 1 and {}",
                    shards, MAX_SIDE_TABLE_SHARDS
                ),
            });
        }

        if crate::logging::parse_level(&self.log.level).is_none() {
            return Err(ConfigError::Invalid {
                field: "log.level",
                reason: format!("unknown level '{}'", self.log.level),
            });
        }

        Ok(())
    }

    /// Generate default config file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;

        fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Install the process-wide configuration.
///
/// Must run before the first object is allocated; fails once any
/// configuration has been installed or read.
pub fn install(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    CONFIG.set(config).map_err(|_| ConfigError::AlreadyInstalled)
}

/// The process-wide configuration
pub fn current() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

#[inline]
pub fn inline_metadata_enabled() -> bool {
    !current().refcount.disable_inline_metadata
}

//! TOML-based configuration for zrebase.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! starting point. Values are layered: defaults, then the TOML file, then
//! `ZREBASE_*` environment variables via [`AppConfig::apply_env_overrides`],
//! then command-line flags applied by the CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::models::DatasetPath;

pub const ENV_SOURCE_ROOT: &str = "ZREBASE_SOURCE_ROOT";
pub const ENV_DEST_ROOT: &str = "ZREBASE_DEST_ROOT";
pub const ENV_DEST_POOL: &str = "ZREBASE_DEST_POOL";
pub const ENV_LOG_LEVEL: &str = "ZREBASE_LOG_LEVEL";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Source and destination lineage roots.
    #[serde(default)]
    pub roots: RootsConfig,

    /// Rebase sequence settings.
    #[serde(default)]
    pub rebase: RebaseConfig,

    /// Send/receive pipeline settings.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Roots
// ---------------------------------------------------------------------------

/// Where the two lineages live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootsConfig {
    /// Source root, e.g. `rpool/zones/z1/ROOT`.
    #[serde(default)]
    pub source: Option<String>,

    /// Destination root. Derived from `dest_pool` and `source` when unset.
    #[serde(default)]
    pub dest: Option<String>,

    /// Pool (or dataset prefix) that holds the replica.
    #[serde(default)]
    pub dest_pool: Option<String>,

    /// Last path segment of the structural container; never a branch.
    #[serde(default = "default_container_name")]
    pub container_name: String,
}

fn default_container_name() -> String {
    "ROOT".into()
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            source: None,
            dest: None,
            dest_pool: None,
            container_name: default_container_name(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rebase
// ---------------------------------------------------------------------------

/// Settings for the reversible rebase sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebaseConfig {
    /// Suffix appended to a destination branch when it is renamed aside.
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,

    /// Container-inheritable isolation property cleared around the rename.
    /// Empty disables the property handling.
    #[serde(default = "default_isolation_property")]
    pub isolation_property: String,

    /// Prefix of bootstrap snapshot labels.
    #[serde(default = "default_bootstrap_prefix")]
    pub bootstrap_prefix: String,
}

fn default_backup_suffix() -> String {
    ".bak".into()
}
fn default_isolation_property() -> String {
    "zoned".into()
}
fn default_bootstrap_prefix() -> String {
    "zrebase".into()
}

impl Default for RebaseConfig {
    fn default() -> Self {
        Self {
            backup_suffix: default_backup_suffix(),
            isolation_property: default_isolation_property(),
            bootstrap_prefix: default_bootstrap_prefix(),
        }
    }
}

impl RebaseConfig {
    pub fn isolation_property(&self) -> Option<&str> {
        let prop = self.isolation_property.trim();
        (!prop.is_empty()).then_some(prop)
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Send/receive pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Path or name of the `zfs` binary.
    #[serde(default = "default_zfs_bin")]
    pub zfs_bin: String,

    /// Extra flags for `zfs send` (before `-I`).
    #[serde(default = "default_send_flags")]
    pub send_flags: Vec<String>,

    /// Flags for `zfs receive` (before the destination root).
    #[serde(default = "default_receive_flags")]
    pub receive_flags: Vec<String>,

    /// Buffer stage argv placed between send and receive. Empty disables it.
    #[serde(default = "default_buffer_command")]
    pub buffer_command: Vec<String>,
}

fn default_zfs_bin() -> String {
    "zfs".into()
}
fn default_send_flags() -> Vec<String> {
    vec!["-R".into()]
}
fn default_receive_flags() -> Vec<String> {
    vec!["-u".into(), "-e".into()]
}
fn default_buffer_command() -> Vec<String> {
    ["mbuffer", "-q", "-m", "128M"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            zfs_bin: default_zfs_bin(),
            send_flags: default_send_flags(),
            receive_flags: default_receive_flags(),
            buffer_command: default_buffer_command(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Render as TOML (used by `zrebase init`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Overlay `ZREBASE_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// injectable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(v) = get(ENV_SOURCE_ROOT) {
            debug!(var = ENV_SOURCE_ROOT, "override from environment");
            self.roots.source = Some(v);
        }
        if let Some(v) = get(ENV_DEST_ROOT) {
            debug!(var = ENV_DEST_ROOT, "override from environment");
            self.roots.dest = Some(v);
        }
        if let Some(v) = get(ENV_DEST_POOL) {
            debug!(var = ENV_DEST_POOL, "override from environment");
            self.roots.dest_pool = Some(v);
        }
        if let Some(v) = get(ENV_LOG_LEVEL) {
            self.logging.level = v;
        }
    }

    /// The configured source root.
    pub fn source_root(&self) -> Result<DatasetPath, ConfigError> {
        let source = self
            .roots
            .source
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "roots.source".into(),
                detail: format!("no source root configured (set it or {})", ENV_SOURCE_ROOT),
            })?;
        DatasetPath::new(source).map_err(|e| ConfigError::InvalidValue {
            field: "roots.source".into(),
            detail: e.to_string(),
        })
    }

    /// The destination root: `roots.dest` if set, else `<dest_pool>/<source>`.
    pub fn derive_dest_root(&self) -> Result<DatasetPath, ConfigError> {
        if let Some(dest) = self.roots.dest.as_deref() {
            return DatasetPath::new(dest).map_err(|e| ConfigError::InvalidValue {
                field: "roots.dest".into(),
                detail: e.to_string(),
            });
        }
        let pool = self
            .roots
            .dest_pool
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "roots.dest".into(),
                detail: format!(
                    "no destination root configured (set roots.dest, roots.dest_pool, {} or {})",
                    ENV_DEST_ROOT, ENV_DEST_POOL
                ),
            })?;
        let source = self.source_root()?;
        DatasetPath::new(format!("{}/{}", pool.trim_end_matches('/'), source)).map_err(|e| {
            ConfigError::InvalidValue {
                field: "roots.dest_pool".into(),
                detail: e.to_string(),
            }
        })
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let source = self.source_root()?;
        let dest = self.derive_dest_root()?;

        if source == dest || source.is_under(&dest) || dest.is_under(&source) {
            return Err(ConfigError::InvalidValue {
                field: "roots.dest".into(),
                detail: format!("source '{}' and destination '{}' overlap", source, dest),
            });
        }
        if self.roots.container_name.trim().is_empty() || self.roots.container_name.contains('/')
        {
            return Err(ConfigError::InvalidValue {
                field: "roots.container_name".into(),
                detail: "must be a single non-empty path segment".into(),
            });
        }
        let suffix = &self.rebase.backup_suffix;
        if suffix.is_empty() || suffix.contains('/') || suffix.contains('@') {
            return Err(ConfigError::InvalidValue {
                field: "rebase.backup_suffix".into(),
                detail: "must be non-empty and contain neither '/' nor '@'".into(),
            });
        }
        let prefix = &self.rebase.bootstrap_prefix;
        if prefix.is_empty() || prefix.contains('/') || prefix.contains('@') {
            return Err(ConfigError::InvalidValue {
                field: "rebase.bootstrap_prefix".into(),
                detail: "must be non-empty and contain neither '/' nor '@'".into(),
            });
        }
        if self.transfer.zfs_bin.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "transfer.zfs_bin".into(),
                detail: "must not be empty".into(),
            });
        }
        if self.transfer.buffer_command.is_empty() {
            warn!("no buffer stage configured; send will write directly into receive");
        }

        Ok(())
    }
}

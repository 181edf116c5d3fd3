//! Error types for the zrebase core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Zfs(#[from] ZfsError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Rebase(#[from] RebaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

// ---------------------------------------------------------------------------
// Model errors
// ---------------------------------------------------------------------------

/// Errors raised while parsing dataset and snapshot names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Not a well-formed dataset path (empty, empty segment, or contains `@`).
    #[error("invalid dataset path '{0}'")]
    InvalidDatasetPath(String),

    /// Not of the form `dataset@label`.
    #[error("invalid snapshot reference '{0}'")]
    InvalidSnapshotRef(String),
}

// ---------------------------------------------------------------------------
// ZFS errors
// ---------------------------------------------------------------------------

/// Errors from the storage backend (the `zfs` CLI or a stand-in).
#[derive(Debug, Error)]
pub enum ZfsError {
    /// The `zfs` binary (or a pipeline stage binary) was not found on `$PATH`.
    #[error("binary not found: {0}")]
    BinaryNotFound(String),

    /// A backend command exited with a non-zero status.
    #[error("command `{command}` failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The requested dataset does not exist.
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    /// The target name is already taken.
    #[error("dataset already exists: {0}")]
    DatasetExists(String),

    /// Tabular `zfs` output could not be turned into typed records.
    #[error("failed to parse zfs output: {0}")]
    ParseError(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// Generic I/O wrapper.
    #[error("zfs I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ZfsError {
    /// Exit code to record for a branch that failed with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
            Self::BinaryNotFound(_) => 127,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory errors
// ---------------------------------------------------------------------------

/// Failure to inventory a root. Fatal for the whole run.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The root dataset does not exist.
    #[error("root dataset '{0}' does not exist")]
    RootMissing(String),

    /// The backend could not list the root's children.
    #[error("failed to inventory '{root}': {source}")]
    Backend {
        root: String,
        #[source]
        source: ZfsError,
    },
}

// ---------------------------------------------------------------------------
// Rebase errors
// ---------------------------------------------------------------------------

/// The executor step a branch failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebaseStep {
    Resolve,
    Precondition,
    ClearIsolation,
    RenameToBackup,
    RestoreIsolation,
    BootstrapSnapshot,
    Transfer,
}

impl fmt::Display for RebaseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve => write!(f, "resolve"),
            Self::Precondition => write!(f, "precondition"),
            Self::ClearIsolation => write!(f, "clear_isolation"),
            Self::RenameToBackup => write!(f, "rename_to_backup"),
            Self::RestoreIsolation => write!(f, "restore_isolation"),
            Self::BootstrapSnapshot => write!(f, "bootstrap_snapshot"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// Errors from the rebase sequence of a single branch. Never fatal to the run.
#[derive(Debug, Error)]
pub enum RebaseError {
    /// A previous safety copy occupies the backup name.
    #[error("backup dataset '{0}' already exists; refusing to overwrite it")]
    BackupExists(String),

    /// The destination has no counterpart of the origin snapshot to clone
    /// from.
    #[error("origin snapshot '{0}' is missing on the destination")]
    OriginMissing(String),

    /// A backend call failed during the named step.
    #[error("step {step} failed: {source}")]
    Step {
        step: RebaseStep,
        #[source]
        source: ZfsError,
    },

    /// The send/buffer/receive pipeline reported a failing stage.
    #[error("transfer pipeline failed (exit {code}): {detail}")]
    TransferFailed { code: i32, detail: String },
}

impl RebaseError {
    pub fn step(&self) -> RebaseStep {
        match self {
            Self::BackupExists(_) | Self::OriginMissing(_) => RebaseStep::Precondition,
            Self::Step { step, .. } => *step,
            Self::TransferFailed { .. } => RebaseStep::Transfer,
        }
    }

    /// Non-zero code recorded as the branch outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BackupExists(_) | Self::OriginMissing(_) => 1,
            Self::Step { source, .. } => source.exit_code(),
            Self::TransferFailed { code, .. } => *code,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// TOML serialization error.
    #[error("configuration serialize error: {0}")]
    SerializeError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

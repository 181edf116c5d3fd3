//! Domain model types used throughout zrebase.
//!
//! These types bridge the storage backend, the reconciliation pipeline, and
//! the run report rendered by the CLI.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

// ---------------------------------------------------------------------------
// Dataset paths
// ---------------------------------------------------------------------------

/// A slash-separated dataset name such as `rpool/zones/z1/ROOT/zbe-60`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetPath(String);

impl DatasetPath {
    pub fn new(name: impl Into<String>) -> Result<Self, ModelError> {
        let name = name.into();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty()
            || trimmed.contains('@')
            || trimmed.split('/').any(|segment| segment.is_empty())
        {
            return Err(ModelError::InvalidDatasetPath(name));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a relative path below this dataset.
    pub fn join(&self, relative: &str) -> Result<Self, ModelError> {
        Self::new(format!("{}/{}", self.0, relative.trim_matches('/')))
    }

    /// Path of this dataset relative to `root`, or `None` if it is not
    /// strictly below `root`.
    pub fn relative_to(&self, root: &DatasetPath) -> Option<&str> {
        self.0
            .strip_prefix(root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    pub fn is_under(&self, root: &DatasetPath) -> bool {
        self.relative_to(root).is_some()
    }

    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<Self> {
        self.0.rsplit_once('/').map(|(parent, _)| Self(parent.to_string()))
    }

    /// The pool is the first path segment.
    pub fn pool(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Sibling name formed by appending `suffix` to the last segment
    /// (`tank/ROOT/be` + `.bak` = `tank/ROOT/be.bak`).
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }

    pub fn snapshot(&self, label: impl Into<String>) -> SnapshotRef {
        SnapshotRef {
            dataset: self.clone(),
            label: label.into(),
        }
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DatasetPath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DatasetPath {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DatasetPath> for String {
    fn from(value: DatasetPath) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of a dataset, written `dataset@label`.
///
/// Labels carry no ordering; snapshots of one dataset are ordered by
/// creation time as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotRef {
    pub dataset: DatasetPath,
    pub label: String,
}

impl SnapshotRef {
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let (dataset, label) = text
            .split_once('@')
            .ok_or_else(|| ModelError::InvalidSnapshotRef(text.to_string()))?;
        if label.is_empty() || label.contains('@') || label.contains('/') {
            return Err(ModelError::InvalidSnapshotRef(text.to_string()));
        }
        let dataset = DatasetPath::new(dataset)
            .map_err(|_| ModelError::InvalidSnapshotRef(text.to_string()))?;
        Ok(Self {
            dataset,
            label: label.to_string(),
        })
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.label)
    }
}

impl FromStr for SnapshotRef {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SnapshotRef {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SnapshotRef> for String {
    fn from(value: SnapshotRef) -> Self {
        value.to_string()
    }
}

/// A snapshot together with its creation time (epoch seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot: SnapshotRef,
    pub created: i64,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Clone origin of a dataset as recorded by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Origin {
    /// Not a clone: the dataset owns its own snapshot history.
    None,
    Snapshot(SnapshotRef),
    /// Present but not a usable snapshot reference.
    Unresolvable(String),
}

impl Origin {
    /// Interpret a raw `origin` property value; `-` and empty are the
    /// backend's "no origin" sentinel.
    pub fn from_property(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value == "-" {
            return Self::None;
        }
        match SnapshotRef::parse(value) {
            Ok(snapshot) => Self::Snapshot(snapshot),
            Err(_) => Self::Unresolvable(value.to_string()),
        }
    }

    pub fn snapshot(&self) -> Option<&SnapshotRef> {
        match self {
            Self::Snapshot(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// One dataset directly under an inventoried root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: DatasetPath,
    pub origin: Origin,
}

// ---------------------------------------------------------------------------
// Transfer range & outcome
// ---------------------------------------------------------------------------

/// Source-side snapshot range to send. `to` is unset while the branch has no
/// snapshot of its own yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRange {
    pub from: SnapshotRef,
    pub to: Option<SnapshotRef>,
}

impl fmt::Display for TransferRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.to {
            Some(to) => write!(f, "({}, {}]", self.from, to),
            None => write!(f, "({}, <bootstrap>]", self.from),
        }
    }
}

/// Per-branch result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    SkippedNotInSource,
    SkippedHistoryOwner,
    SkippedNoOrigin,
    SkippedHasChildren,
    SkippedAmbiguousTip,
    /// Audit mode: resolved and rebasable, nothing executed.
    Planned,
    RebasedOk,
    RebasedFailed { code: i32 },
}

impl Outcome {
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            Self::SkippedNotInSource
                | Self::SkippedHistoryOwner
                | Self::SkippedNoOrigin
                | Self::SkippedHasChildren
                | Self::SkippedAmbiguousTip
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::RebasedFailed { .. })
    }

    /// Zero for everything but a failed rebase.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RebasedFailed { code } => *code,
            _ => 0,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SkippedNotInSource => write!(f, "skipped: not in source"),
            Self::SkippedHistoryOwner => write!(f, "skipped: history owner"),
            Self::SkippedNoOrigin => write!(f, "skipped: no usable origin"),
            Self::SkippedHasChildren => write!(f, "skipped: has nested datasets"),
            Self::SkippedAmbiguousTip => write!(f, "skipped: ambiguous latest snapshot"),
            Self::Planned => write!(f, "planned"),
            Self::RebasedOk => write!(f, "rebased"),
            Self::RebasedFailed { code } => write!(f, "failed (exit {})", code),
        }
    }
}

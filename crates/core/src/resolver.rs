//! Range resolver: classify a candidate branch against the source inventory
//! and compute the snapshot range to send.

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::backend::StorageBackend;
use crate::errors::ZfsError;
use crate::inventory::Inventory;
use crate::models::{DatasetPath, Origin, Outcome, SnapshotRef, TransferRange};

/// Result of resolving one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeOutcome {
    /// No source entry; the source is authoritative, so leave it alone.
    NotInSource,
    /// The source branch is not a clone: it owns its history.
    HistoryOwner,
    /// The origin is set but unusable (unparseable, outside the source root,
    /// or no longer present).
    NoOrigin { origin: String },
    /// The source branch has nested datasets, which are not reconciled.
    HasChildren,
    /// Several snapshots share the newest creation time.
    AmbiguousTip { candidates: Vec<SnapshotRef> },
    /// Rebasable. `range.to` is unset when the branch has no snapshot yet.
    Ready { range: TransferRange },
}

impl RangeOutcome {
    /// Per-branch outcome if nothing further is done: a skip, or `Planned`
    /// for a rebasable branch.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::NotInSource => Outcome::SkippedNotInSource,
            Self::HistoryOwner => Outcome::SkippedHistoryOwner,
            Self::NoOrigin { .. } => Outcome::SkippedNoOrigin,
            Self::HasChildren => Outcome::SkippedHasChildren,
            Self::AmbiguousTip { .. } => Outcome::SkippedAmbiguousTip,
            Self::Ready { .. } => Outcome::Planned,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::NotInSource => "branch does not exist on the source".into(),
            Self::HistoryOwner => "source branch owns its own history".into(),
            Self::NoOrigin { origin } => format!("origin '{}' is not usable", origin),
            Self::HasChildren => "branch has nested datasets".into(),
            Self::AmbiguousTip { candidates } => format!(
                "latest snapshot is ambiguous between {}",
                candidates
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::Ready { range } => format!("transfer {}", range),
        }
    }
}

/// The newest snapshot of a dataset by creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatestSnapshot {
    None,
    One(SnapshotRef),
    Tied(Vec<SnapshotRef>),
}

/// Look up the creation-time-maximal snapshot of `dataset`.
///
/// Relies on the backend returning snapshots in creation order; labels are
/// never consulted.
pub async fn latest_snapshot(
    backend: &dyn StorageBackend,
    dataset: &DatasetPath,
) -> Result<LatestSnapshot, ZfsError> {
    let snapshots = backend.list_snapshots(dataset).await?;
    let Some(newest) = snapshots.iter().map(|info| info.created).max() else {
        return Ok(LatestSnapshot::None);
    };
    let mut tip: Vec<SnapshotRef> = snapshots
        .into_iter()
        .filter(|info| info.created == newest)
        .map(|info| info.snapshot)
        .collect();
    Ok(match tip.len() {
        1 => LatestSnapshot::One(tip.remove(0)),
        _ => LatestSnapshot::Tied(tip),
    })
}

/// Resolve `branch` against the source inventory.
///
/// Backend failures are returned as errors; the controller records them as a
/// failure of this branch only.
#[instrument(skip_all, fields(branch = %branch))]
pub async fn resolve_range(
    backend: &dyn StorageBackend,
    branch: &str,
    source_inventory: &Inventory,
) -> Result<RangeOutcome, ZfsError> {
    let Some(entry) = source_inventory.get(branch) else {
        warn!(branch, "not present on source, skipping");
        return Ok(RangeOutcome::NotInSource);
    };

    let origin = match &entry.origin {
        Origin::None => {
            debug!(branch, "history owner");
            return Ok(RangeOutcome::HistoryOwner);
        }
        Origin::Unresolvable(raw) => {
            return Ok(RangeOutcome::NoOrigin {
                origin: raw.clone(),
            })
        }
        Origin::Snapshot(origin) => origin,
    };

    if !origin.dataset.is_under(source_inventory.root()) {
        warn!(branch, %origin, "origin lies outside the source root");
        return Ok(RangeOutcome::NoOrigin {
            origin: origin.to_string(),
        });
    }
    let origin_present = match backend.list_snapshots(&origin.dataset).await {
        Ok(snapshots) => snapshots.iter().any(|info| &info.snapshot == origin),
        Err(ZfsError::DatasetNotFound(_)) => false,
        Err(e) => return Err(e),
    };
    if !origin_present {
        warn!(branch, %origin, "origin snapshot no longer exists");
        return Ok(RangeOutcome::NoOrigin {
            origin: origin.to_string(),
        });
    }

    if backend.has_child_datasets(&entry.name).await? {
        warn!(branch, "nested datasets are not reconciled");
        return Ok(RangeOutcome::HasChildren);
    }

    let to = match latest_snapshot(backend, &entry.name).await? {
        LatestSnapshot::None => None,
        LatestSnapshot::One(latest) => Some(latest),
        LatestSnapshot::Tied(candidates) => {
            warn!(branch, count = candidates.len(), "ambiguous latest snapshot");
            return Ok(RangeOutcome::AmbiguousTip { candidates });
        }
    };

    let range = TransferRange {
        from: origin.clone(),
        to,
    };
    debug!(branch, %range, "resolved transfer range");
    Ok(RangeOutcome::Ready { range })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::inventory::list_immediate_children;

    async fn source_inventory(backend: &MemoryBackend) -> Inventory {
        list_immediate_children(backend, &DatasetPath::new("src/ROOT").unwrap())
            .await
            .unwrap()
    }

    fn base() -> MemoryBackend {
        MemoryBackend::new()
            .with_dataset("src/ROOT", None)
            .unwrap()
            .with_dataset("src/ROOT/zbe-60", None)
            .unwrap()
            .with_snapshot("src/ROOT/zbe-60@S1")
            .unwrap()
            .with_snapshot("src/ROOT/zbe-60@S2")
            .unwrap()
            .with_dataset("src/ROOT/zbe-59", Some("src/ROOT/zbe-60@S1"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_not_in_source() {
        let backend = base();
        let inv = source_inventory(&backend).await;
        let outcome = resolve_range(&backend, "zbe-1", &inv).await.unwrap();
        assert_eq!(outcome, RangeOutcome::NotInSource);
        assert_eq!(outcome.outcome(), Outcome::SkippedNotInSource);
    }

    #[tokio::test]
    async fn test_history_owner() {
        let backend = base();
        let inv = source_inventory(&backend).await;
        let outcome = resolve_range(&backend, "zbe-60", &inv).await.unwrap();
        assert_eq!(outcome, RangeOutcome::HistoryOwner);
    }

    #[tokio::test]
    async fn test_no_latest_yet() {
        let backend = base();
        let inv = source_inventory(&backend).await;
        let outcome = resolve_range(&backend, "zbe-59", &inv).await.unwrap();
        match outcome {
            RangeOutcome::Ready { range } => {
                assert_eq!(range.from.to_string(), "src/ROOT/zbe-60@S1");
                assert!(range.to.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_latest_by_creation_time_not_label() {
        let backend = base()
            .with_snapshot_at("src/ROOT/zbe-59@zzz-old", 100)
            .unwrap()
            .with_snapshot_at("src/ROOT/zbe-59@aaa-new", 200)
            .unwrap();
        let inv = source_inventory(&backend).await;
        match resolve_range(&backend, "zbe-59", &inv).await.unwrap() {
            RangeOutcome::Ready { range } => {
                assert_eq!(range.to.unwrap().label, "aaa-new");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ambiguous_tip() {
        let backend = base()
            .with_snapshot_at("src/ROOT/zbe-59@a", 500)
            .unwrap()
            .with_snapshot_at("src/ROOT/zbe-59@b", 500)
            .unwrap();
        let inv = source_inventory(&backend).await;
        let outcome = resolve_range(&backend, "zbe-59", &inv).await.unwrap();
        match &outcome {
            RangeOutcome::AmbiguousTip { candidates } => assert_eq!(candidates.len(), 2),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(outcome.outcome(), Outcome::SkippedAmbiguousTip);
    }

    #[tokio::test]
    async fn test_unresolvable_and_foreign_origins() {
        let backend = base()
            .with_dataset("src/ROOT/odd", Some("not-a-snapshot"))
            .unwrap()
            .with_dataset("other", None)
            .unwrap()
            .with_snapshot("other@x")
            .unwrap()
            .with_dataset("src/ROOT/foreign", Some("other@x"))
            .unwrap()
            .with_dataset("src/ROOT/stale", Some("src/ROOT/zbe-60@gone"))
            .unwrap();
        let inv = source_inventory(&backend).await;
        for branch in ["odd", "foreign", "stale"] {
            let outcome = resolve_range(&backend, branch, &inv).await.unwrap();
            assert!(
                matches!(outcome, RangeOutcome::NoOrigin { .. }),
                "{branch}: {:?}",
                outcome
            );
        }
    }

    #[tokio::test]
    async fn test_nested_children_rejected() {
        let backend = base()
            .with_dataset("src/ROOT/zbe-59/var", None)
            .unwrap();
        let inv = source_inventory(&backend).await;
        let outcome = resolve_range(&backend, "zbe-59", &inv).await.unwrap();
        assert_eq!(outcome, RangeOutcome::HasChildren);
    }

    #[tokio::test]
    async fn test_latest_snapshot_helper() {
        let backend = base();
        let latest = latest_snapshot(&backend, &DatasetPath::new("src/ROOT/zbe-60").unwrap())
            .await
            .unwrap();
        assert_eq!(
            latest,
            LatestSnapshot::One(SnapshotRef::parse("src/ROOT/zbe-60@S2").unwrap())
        );
    }
}

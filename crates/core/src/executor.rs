//! Rebase executor: the reversible mutation sequence for one branch.
//!
//! 1. Clear the isolation property on the destination branch, rename it to
//!    `<branch><backup_suffix>`, restore the inherited property on the backup.
//! 2. If the source branch has no snapshot yet, create a bootstrap snapshot.
//! 3. Send `(from, to]` and let the receiver recreate the destination branch
//!    as a clone of `from`'s counterpart.
//!
//! Each step must succeed before the next starts. A failure stops the branch
//! where it is; nothing is rolled back and nothing is retried.

use serde::Serialize;
use tracing::{error, info, instrument};

use crate::backend::StorageBackend;
use crate::config::RebaseConfig;
use crate::errors::{RebaseError, RebaseStep, ZfsError};
use crate::models::{DatasetPath, Outcome, SnapshotRef, TransferRange};
use crate::naming::SnapshotLabelGenerator;

/// What the executor did for one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebaseReport {
    pub outcome: Outcome,
    /// Where the previous destination branch was moved, once renamed.
    pub backup: Option<DatasetPath>,
    /// Bootstrap snapshot created on the source branch, if any.
    pub bootstrap: Option<SnapshotRef>,
    /// The range actually sent (with `to` filled in), once known.
    pub range: Option<TransferRange>,
    /// Step and message of the failure, if any.
    pub failed_step: Option<RebaseStep>,
    pub error: Option<String>,
}

/// Runs the rebase sequence against one backend.
///
/// The label generator is borrowed so that labels stay unique across every
/// executor a reconciler creates.
pub struct Executor<'a> {
    backend: &'a dyn StorageBackend,
    source_root: DatasetPath,
    dest_root: DatasetPath,
    config: RebaseConfig,
    labels: &'a SnapshotLabelGenerator,
}

impl<'a> Executor<'a> {
    pub fn new(
        backend: &'a dyn StorageBackend,
        source_root: DatasetPath,
        dest_root: DatasetPath,
        config: RebaseConfig,
        labels: &'a SnapshotLabelGenerator,
    ) -> Self {
        Self {
            backend,
            source_root,
            dest_root,
            config,
            labels,
        }
    }

    /// Rebase `branch` onto `range`. Failures are folded into the report.
    #[instrument(skip_all, fields(branch = %branch))]
    pub async fn rebase(&self, branch: &str, range: &TransferRange) -> RebaseReport {
        let mut report = RebaseReport {
            outcome: Outcome::RebasedOk,
            backup: None,
            bootstrap: None,
            range: None,
            failed_step: None,
            error: None,
        };

        match self.run_steps(branch, range, &mut report).await {
            Ok(()) => {
                info!(branch, "rebase completed");
            }
            Err(e) => {
                error!(branch, step = %e.step(), error = %e, "rebase failed");
                report.outcome = Outcome::RebasedFailed { code: e.exit_code() };
                report.failed_step = Some(e.step());
                report.error = Some(e.to_string());
            }
        }
        report
    }

    async fn run_steps(
        &self,
        branch: &str,
        range: &TransferRange,
        report: &mut RebaseReport,
    ) -> Result<(), RebaseError> {
        let step = |step: RebaseStep| move |source: ZfsError| RebaseError::Step { step, source };

        let dest_branch = self
            .dest_root
            .join(branch)
            .map_err(|e| step(RebaseStep::Precondition)(e.into()))?;
        let source_branch = self
            .source_root
            .join(branch)
            .map_err(|e| step(RebaseStep::Precondition)(e.into()))?;
        let backup = dest_branch.with_suffix(&self.config.backup_suffix);

        if self
            .backend
            .dataset_exists(&backup)
            .await
            .map_err(step(RebaseStep::Precondition))?
        {
            return Err(RebaseError::BackupExists(backup.to_string()));
        }

        // The receiver clones from the origin's counterpart; without it the
        // transfer would fail after the branch was already moved aside.
        let origin_rel = range
            .from
            .dataset
            .relative_to(&self.source_root)
            .unwrap_or_else(|| range.from.dataset.last_segment());
        let counterpart = self
            .dest_root
            .join(origin_rel)
            .map_err(|e| step(RebaseStep::Precondition)(e.into()))?
            .snapshot(range.from.label.clone());
        let counterpart_present = match self.backend.list_snapshots(&counterpart.dataset).await {
            Ok(snapshots) => snapshots.iter().any(|info| info.snapshot == counterpart),
            Err(ZfsError::DatasetNotFound(_)) => false,
            Err(e) => return Err(step(RebaseStep::Precondition)(e)),
        };
        if !counterpart_present {
            return Err(RebaseError::OriginMissing(counterpart.to_string()));
        }

        // Step 1: move the current destination copy aside.
        if let Some(property) = self.config.isolation_property() {
            self.backend
                .set_property(&dest_branch, property, "off")
                .await
                .map_err(step(RebaseStep::ClearIsolation))?;
        }
        self.backend
            .rename_dataset(&dest_branch, &backup)
            .await
            .map_err(step(RebaseStep::RenameToBackup))?;
        info!(from = %dest_branch, to = %backup, "destination branch moved aside");
        report.backup = Some(backup.clone());
        if let Some(property) = self.config.isolation_property() {
            self.backend
                .inherit_property(&backup, property)
                .await
                .map_err(step(RebaseStep::RestoreIsolation))?;
        }

        // Step 2: give a snapshot-less source branch an endpoint.
        let to = match &range.to {
            Some(to) => to.clone(),
            None => {
                let bootstrap = source_branch.snapshot(self.labels.next_label());
                self.backend
                    .create_snapshot(&bootstrap, true)
                    .await
                    .map_err(step(RebaseStep::BootstrapSnapshot))?;
                info!(snapshot = %bootstrap, "bootstrap snapshot created");
                report.bootstrap = Some(bootstrap.clone());
                bootstrap
            }
        };
        let effective = TransferRange {
            from: range.from.clone(),
            to: Some(to.clone()),
        };
        report.range = Some(effective.clone());

        // Step 3: the receiver materializes the destination branch.
        info!(range = %effective, dest_root = %self.dest_root, "sending incremental stream");
        let status = self
            .backend
            .transfer_incremental(&range.from, &to, &self.dest_root)
            .await
            .map_err(step(RebaseStep::Transfer))?;
        if !status.success() {
            return Err(RebaseError::TransferFailed {
                code: status.code(),
                detail: status.failure_summary(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Mutation};
    use crate::models::Origin;

    fn ds(s: &str) -> DatasetPath {
        DatasetPath::new(s).unwrap()
    }

    fn snap(s: &str) -> SnapshotRef {
        SnapshotRef::parse(s).unwrap()
    }

    /// Source and destination trees for the zbe-59/zbe-60 scenario.
    fn scenario() -> MemoryBackend {
        MemoryBackend::new()
            .with_dataset("rpool/ROOT", None)
            .unwrap()
            .with_dataset("rpool/ROOT/zbe-60", None)
            .unwrap()
            .with_snapshot("rpool/ROOT/zbe-60@S1")
            .unwrap()
            .with_dataset("rpool/ROOT/zbe-59", Some("rpool/ROOT/zbe-60@S1"))
            .unwrap()
            .with_dataset("backup/ROOT", None)
            .unwrap()
            .with_dataset("backup/ROOT/zbe-60", None)
            .unwrap()
            .with_snapshot("backup/ROOT/zbe-60@S1")
            .unwrap()
            .with_dataset("backup/ROOT/zbe-59", None)
            .unwrap()
            .with_property("backup/ROOT/zbe-59", "zoned", "on")
    }

    fn executor<'a>(
        backend: &'a MemoryBackend,
        labels: &'a SnapshotLabelGenerator,
    ) -> Executor<'a> {
        Executor::new(
            backend,
            ds("rpool/ROOT"),
            ds("backup/ROOT"),
            RebaseConfig::default(),
            labels,
        )
    }

    fn labels() -> SnapshotLabelGenerator {
        SnapshotLabelGenerator::with_pid("zrebase", 7)
    }

    #[tokio::test]
    async fn test_bootstrap_rename_and_transfer() {
        let backend = scenario();
        let range = TransferRange {
            from: snap("rpool/ROOT/zbe-60@S1"),
            to: None,
        };
        let report = executor(&backend, &labels()).rebase("zbe-59", &range).await;

        assert_eq!(report.outcome, Outcome::RebasedOk);
        assert_eq!(report.backup, Some(ds("backup/ROOT/zbe-59.bak")));
        let bootstrap = report.bootstrap.clone().unwrap();
        assert_eq!(bootstrap.dataset, ds("rpool/ROOT/zbe-59"));
        assert!(bootstrap.label.starts_with("zrebase-"));

        let mutations = backend.mutations();
        assert_eq!(
            mutations,
            vec![
                Mutation::SetProperty {
                    dataset: "backup/ROOT/zbe-59".into(),
                    property: "zoned".into(),
                    value: "off".into(),
                },
                Mutation::Rename {
                    from: "backup/ROOT/zbe-59".into(),
                    to: "backup/ROOT/zbe-59.bak".into(),
                },
                Mutation::InheritProperty {
                    dataset: "backup/ROOT/zbe-59.bak".into(),
                    property: "zoned".into(),
                },
                Mutation::CreateSnapshot {
                    snapshot: bootstrap.to_string(),
                    recursive: true,
                },
                Mutation::Transfer {
                    from: "rpool/ROOT/zbe-60@S1".into(),
                    to: bootstrap.to_string(),
                    dest_root: "backup/ROOT".into(),
                },
            ]
        );

        // The receiver recreated the branch as a clone of the shared ancestor.
        assert_eq!(
            backend.origin_of("backup/ROOT/zbe-59"),
            Some(Origin::Snapshot(snap("backup/ROOT/zbe-60@S1")))
        );
        assert!(backend.contains("backup/ROOT/zbe-59.bak"));
        assert_eq!(backend.property_of("backup/ROOT/zbe-59.bak", "zoned"), None);
    }

    #[tokio::test]
    async fn test_existing_latest_skips_bootstrap() {
        let backend = scenario().with_snapshot("rpool/ROOT/zbe-59@T1").unwrap();
        let range = TransferRange {
            from: snap("rpool/ROOT/zbe-60@S1"),
            to: Some(snap("rpool/ROOT/zbe-59@T1")),
        };
        let report = executor(&backend, &labels()).rebase("zbe-59", &range).await;
        assert_eq!(report.outcome, Outcome::RebasedOk);
        assert!(report.bootstrap.is_none());
        assert!(!backend
            .mutations()
            .iter()
            .any(|m| matches!(m, Mutation::CreateSnapshot { .. })));
        assert_eq!(backend.snapshot_labels("backup/ROOT/zbe-59"), vec!["T1"]);
    }

    #[tokio::test]
    async fn test_existing_backup_blocks_without_mutation() {
        let backend = scenario().with_dataset("backup/ROOT/zbe-59.bak", None).unwrap();
        let range = TransferRange {
            from: snap("rpool/ROOT/zbe-60@S1"),
            to: None,
        };
        let report = executor(&backend, &labels()).rebase("zbe-59", &range).await;
        assert_eq!(report.outcome, Outcome::RebasedFailed { code: 1 });
        assert_eq!(report.failed_step, Some(RebaseStep::Precondition));
        assert!(backend.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_rename_failure_stops_sequence() {
        let backend = scenario().fail_rename_for("backup/ROOT/zbe-59", 2);
        let range = TransferRange {
            from: snap("rpool/ROOT/zbe-60@S1"),
            to: None,
        };
        let report = executor(&backend, &labels()).rebase("zbe-59", &range).await;
        assert_eq!(report.outcome, Outcome::RebasedFailed { code: 2 });
        assert_eq!(report.failed_step, Some(RebaseStep::RenameToBackup));
        assert!(report.backup.is_none());
        // Only the property change happened before the failure.
        assert_eq!(backend.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_failure_keeps_backup() {
        let backend = scenario().fail_transfer_for("rpool/ROOT/zbe-59", 9);
        let range = TransferRange {
            from: snap("rpool/ROOT/zbe-60@S1"),
            to: None,
        };
        let report = executor(&backend, &labels()).rebase("zbe-59", &range).await;
        assert_eq!(report.outcome, Outcome::RebasedFailed { code: 9 });
        assert_eq!(report.failed_step, Some(RebaseStep::Transfer));
        assert!(report.error.unwrap().contains("injected buffer failure"));
        assert!(backend.contains("backup/ROOT/zbe-59.bak"));
        assert!(!backend.contains("backup/ROOT/zbe-59"));
    }

    #[tokio::test]
    async fn test_isolation_property_can_be_disabled() {
        let backend = scenario();
        let config = RebaseConfig {
            isolation_property: String::new(),
            ..RebaseConfig::default()
        };
        let labels = labels();
        let executor = Executor::new(
            &backend,
            ds("rpool/ROOT"),
            ds("backup/ROOT"),
            config,
            &labels,
        );
        let range = TransferRange {
            from: snap("rpool/ROOT/zbe-60@S1"),
            to: None,
        };
        let report = executor.rebase("zbe-59", &range).await;
        assert_eq!(report.outcome, Outcome::RebasedOk);
        assert!(!backend.mutations().iter().any(|m| matches!(
            m,
            Mutation::SetProperty { .. } | Mutation::InheritProperty { .. }
        )));
    }

    #[tokio::test]
    async fn test_missing_origin_counterpart_blocks_without_mutation() {
        let backend = MemoryBackend::new()
            .with_dataset("rpool/ROOT", None)
            .unwrap()
            .with_dataset("rpool/ROOT/zbe-60", None)
            .unwrap()
            .with_snapshot("rpool/ROOT/zbe-60@S1")
            .unwrap()
            .with_dataset("rpool/ROOT/zbe-59", Some("rpool/ROOT/zbe-60@S1"))
            .unwrap()
            .with_dataset("backup/ROOT", None)
            .unwrap()
            .with_dataset("backup/ROOT/zbe-59", None)
            .unwrap();
        let range = TransferRange {
            from: snap("rpool/ROOT/zbe-60@S1"),
            to: None,
        };
        let report = executor(&backend, &labels()).rebase("zbe-59", &range).await;
        assert_eq!(report.outcome, Outcome::RebasedFailed { code: 1 });
        assert_eq!(report.failed_step, Some(RebaseStep::Precondition));
        assert!(report.error.unwrap().contains("backup/ROOT/zbe-60@S1"));
        assert!(backend.mutations().is_empty());
        assert!(backend.contains("backup/ROOT/zbe-59"));
    }
}

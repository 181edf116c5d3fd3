//! Run controller: drives every candidate branch through
//! resolve → rebase and accumulates the outcomes.
//!
//! Branches are processed strictly one after another. A failing branch is
//! recorded and the run moves on; only an inventory failure aborts the run,
//! before any branch is touched. A dry run wraps the backend in
//! [`DryRunBackend`] for its duration, so no mutation reaches it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::backend::{DryRunBackend, StorageBackend};
use crate::classifier::candidate_branches;
use crate::config::{AppConfig, RebaseConfig};
use crate::errors::{ConfigError, InventoryError, RebaseStep};
use crate::executor::Executor;
use crate::inventory::{list_immediate_children, Inventory};
use crate::models::{DatasetPath, Outcome};
use crate::naming::SnapshotLabelGenerator;
use crate::report::{BranchReport, RunReport};
use crate::resolver::{resolve_range, RangeOutcome};

/// How a run treats the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Mutations go to the backend.
    Live,
    /// Reads hit the backend; mutations are logged and collected only.
    DryRun,
    /// Classification only; the executor is never invoked.
    Audit,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::DryRun => write!(f, "dry-run"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

/// Reconciles the destination root with the source root.
pub struct Reconciler<'a> {
    backend: &'a dyn StorageBackend,
    source_root: DatasetPath,
    dest_root: DatasetPath,
    container_name: String,
    rebase: RebaseConfig,
    labels: SnapshotLabelGenerator,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        backend: &'a dyn StorageBackend,
        source_root: DatasetPath,
        dest_root: DatasetPath,
        container_name: impl Into<String>,
        rebase: RebaseConfig,
    ) -> Self {
        let labels = SnapshotLabelGenerator::new(rebase.bootstrap_prefix.clone());
        Self {
            backend,
            source_root,
            dest_root,
            container_name: container_name.into(),
            rebase,
            labels,
        }
    }

    /// Build from a validated configuration.
    pub fn from_config(
        backend: &'a dyn StorageBackend,
        config: &AppConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            backend,
            config.source_root()?,
            config.derive_dest_root()?,
            config.roots.container_name.clone(),
            config.rebase.clone(),
        ))
    }

    /// Replace the bootstrap label generator (tests pin the process id).
    pub fn with_labels(mut self, labels: SnapshotLabelGenerator) -> Self {
        self.labels = labels;
        self
    }

    pub fn source_root(&self) -> &DatasetPath {
        &self.source_root
    }

    pub fn dest_root(&self) -> &DatasetPath {
        &self.dest_root
    }

    /// Run one reconciliation pass.
    #[instrument(skip_all, fields(mode = %mode, source = %self.source_root, dest = %self.dest_root))]
    pub async fn run(&self, mode: RunMode) -> Result<RunReport, InventoryError> {
        match mode {
            RunMode::DryRun => {
                let dry = DryRunBackend::new(self.backend);
                let mut report = self.run_on(&dry, mode).await?;
                report.planned_commands = dry.planned();
                Ok(report)
            }
            RunMode::Live | RunMode::Audit => self.run_on(self.backend, mode).await,
        }
    }

    async fn run_on(
        &self,
        backend: &dyn StorageBackend,
        mode: RunMode,
    ) -> Result<RunReport, InventoryError> {
        let mut report = RunReport::new(mode, self.source_root.clone(), self.dest_root.clone());

        let source_inventory = list_immediate_children(backend, &self.source_root).await?;
        let dest_inventory = list_immediate_children(backend, &self.dest_root).await?;
        let candidates = candidate_branches(
            &dest_inventory,
            &self.container_name,
            &self.rebase.backup_suffix,
        );
        info!(
            source_entries = source_inventory.len(),
            dest_entries = dest_inventory.len(),
            candidates = candidates.len(),
            "inventory complete"
        );

        let executor = Executor::new(
            backend,
            self.source_root.clone(),
            self.dest_root.clone(),
            self.rebase.clone(),
            &self.labels,
        );
        for branch in &candidates {
            let entry = self
                .process_branch(backend, &executor, branch, &source_inventory, mode)
                .await;
            match &entry.outcome {
                Outcome::RebasedFailed { code } => {
                    error!(branch = %branch, code, reason = %entry.reason, "branch failed")
                }
                outcome if outcome.is_skipped() => {
                    warn!(branch = %branch, %outcome, reason = %entry.reason, "branch skipped")
                }
                outcome => info!(branch = %branch, %outcome, reason = %entry.reason, "branch done"),
            }
            report.branches.push(entry);
        }

        report.completed_at = Some(Utc::now());
        let summary = report.summary();
        info!(
            rebased = summary.rebased,
            failed = summary.failed,
            skipped = summary.skipped,
            planned = summary.planned,
            status = report.final_status(),
            "run complete"
        );
        Ok(report)
    }

    async fn process_branch(
        &self,
        backend: &dyn StorageBackend,
        executor: &Executor<'_>,
        branch: &str,
        source_inventory: &Inventory,
        mode: RunMode,
    ) -> BranchReport {
        let resolution = match resolve_range(backend, branch, source_inventory).await {
            Ok(resolution) => resolution,
            Err(e) => {
                return BranchReport {
                    branch: branch.to_string(),
                    outcome: Outcome::RebasedFailed { code: e.exit_code() },
                    reason: format!("resolving range failed: {}", e),
                    range: None,
                    backup: None,
                    bootstrap: None,
                    failed_step: Some(RebaseStep::Resolve),
                };
            }
        };

        let range = match resolution {
            RangeOutcome::Ready { range } => range,
            skipped => {
                return BranchReport::skipped(branch, skipped.outcome(), skipped.describe());
            }
        };

        if mode == RunMode::Audit {
            return BranchReport {
                branch: branch.to_string(),
                outcome: Outcome::Planned,
                reason: format!("would transfer {}", range),
                range: Some(range),
                backup: None,
                bootstrap: None,
                failed_step: None,
            };
        }

        let rebase = executor.rebase(branch, &range).await;
        let reason = match (&rebase.error, &rebase.range) {
            (Some(error), _) => error.clone(),
            (None, Some(sent)) => format!("transferred {}", sent),
            (None, None) => format!("transferred {}", range),
        };
        BranchReport {
            branch: branch.to_string(),
            outcome: rebase.outcome,
            reason,
            range: rebase.range.or(Some(range)),
            backup: rebase.backup,
            bootstrap: rebase.bootstrap,
            failed_step: rebase.failed_step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn ds(s: &str) -> DatasetPath {
        DatasetPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_inventory_failure_aborts_before_any_branch() {
        let backend = MemoryBackend::new()
            .with_dataset("src/ROOT", None)
            .unwrap();
        let reconciler = Reconciler::new(
            &backend,
            ds("src/ROOT"),
            ds("dst/ROOT"),
            "ROOT",
            RebaseConfig::default(),
        );
        let err = reconciler.run(RunMode::Live).await.unwrap_err();
        assert!(matches!(err, InventoryError::RootMissing(root) if root == "dst/ROOT"));
        assert!(backend.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_from_config_validates() {
        let backend = MemoryBackend::new();
        let mut config = AppConfig::default();
        assert!(Reconciler::from_config(&backend, &config).is_err());

        config.roots.source = Some("rpool/ROOT".into());
        config.roots.dest_pool = Some("backup".into());
        let reconciler = Reconciler::from_config(&backend, &config).unwrap();
        assert_eq!(reconciler.dest_root().as_str(), "backup/rpool/ROOT");
    }

    #[tokio::test]
    async fn test_dry_run_mode_never_mutates_the_backend() {
        let backend = MemoryBackend::new()
            .with_dataset("src/ROOT", None)
            .unwrap()
            .with_dataset("src/ROOT/zbe-60", None)
            .unwrap()
            .with_snapshot("src/ROOT/zbe-60@S1")
            .unwrap()
            .with_dataset("src/ROOT/zbe-59", Some("src/ROOT/zbe-60@S1"))
            .unwrap()
            .with_dataset("dst/ROOT", None)
            .unwrap()
            .with_dataset("dst/ROOT/zbe-60", None)
            .unwrap()
            .with_snapshot("dst/ROOT/zbe-60@S1")
            .unwrap()
            .with_dataset("dst/ROOT/zbe-59", None)
            .unwrap()
            .with_property("dst/ROOT/zbe-59", "zoned", "on");
        let reconciler = Reconciler::new(
            &backend,
            ds("src/ROOT"),
            ds("dst/ROOT"),
            "ROOT",
            RebaseConfig::default(),
        );
        let report = reconciler.run(RunMode::DryRun).await.unwrap();

        assert_eq!(report.mode, RunMode::DryRun);
        assert!(backend.mutations().is_empty());
        assert!(!backend.contains("dst/ROOT/zbe-59.bak"));
        assert!(report
            .planned_commands
            .contains(&"zfs rename dst/ROOT/zbe-59 dst/ROOT/zbe-59.bak".to_string()));
    }

    #[test]
    fn test_run_mode_display() {
        assert_eq!(RunMode::DryRun.to_string(), "dry-run");
        assert_eq!(
            serde_json::to_string(&RunMode::Audit).unwrap(),
            "\"audit\""
        );
    }
}

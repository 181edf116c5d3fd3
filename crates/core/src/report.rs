//! Per-branch and aggregate results of one run.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::RunMode;
use crate::errors::RebaseStep;
use crate::models::{DatasetPath, Outcome, SnapshotRef, TransferRange};

/// What happened to one candidate branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchReport {
    pub branch: String,
    pub outcome: Outcome,
    /// Classification reason or failure message, for the narrative.
    pub reason: String,
    pub range: Option<TransferRange>,
    pub backup: Option<DatasetPath>,
    pub bootstrap: Option<SnapshotRef>,
    pub failed_step: Option<RebaseStep>,
}

impl BranchReport {
    pub fn skipped(branch: &str, outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            branch: branch.to_string(),
            outcome,
            reason: reason.into(),
            range: None,
            backup: None,
            bootstrap: None,
            failed_step: None,
        }
    }
}

/// Counts by outcome class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub candidates: usize,
    pub rebased: usize,
    pub failed: usize,
    pub skipped: usize,
    pub planned: usize,
}

/// Result of one reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub source_root: DatasetPath,
    pub dest_root: DatasetPath,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub branches: Vec<BranchReport>,
    /// Mutating commands a dry run held back, in order.
    pub planned_commands: Vec<String>,
}

impl RunReport {
    pub fn new(mode: RunMode, source_root: DatasetPath, dest_root: DatasetPath) -> Self {
        Self {
            mode,
            source_root,
            dest_root,
            started_at: Utc::now(),
            completed_at: None,
            branches: Vec::new(),
            planned_commands: Vec::new(),
        }
    }

    /// Last non-zero per-branch code, or 0 when every branch succeeded or
    /// was skipped.
    pub fn final_status(&self) -> i32 {
        self.branches
            .iter()
            .map(|b| b.outcome.exit_code())
            .filter(|code| *code != 0)
            .last()
            .unwrap_or(0)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            candidates: self.branches.len(),
            ..RunSummary::default()
        };
        for branch in &self.branches {
            match &branch.outcome {
                Outcome::RebasedOk => summary.rebased += 1,
                Outcome::RebasedFailed { .. } => summary.failed += 1,
                Outcome::Planned => summary.planned += 1,
                _ => summary.skipped += 1,
            }
        }
        summary
    }

    /// Branch name and outcome pairs, in processing order.
    pub fn classification(&self) -> Vec<(String, Outcome)> {
        self.branches
            .iter()
            .map(|b| (b.branch.clone(), b.outcome.clone()))
            .collect()
    }

    pub fn branch(&self, name: &str) -> Option<&BranchReport> {
        self.branches.iter().find(|b| b.branch == name)
    }
}

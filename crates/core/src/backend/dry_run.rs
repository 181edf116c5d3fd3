//! Dry-run decorator: reads hit the wrapped backend, mutations are only
//! logged and collected.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::StorageBackend;
use crate::errors::ZfsError;
use crate::models::{DatasetPath, InventoryEntry, SnapshotInfo, SnapshotRef};
use crate::pipeline::PipeStatus;

/// Wraps a backend so that no mutating call ever reaches it.
#[derive(Debug)]
pub struct DryRunBackend<B> {
    inner: B,
    planned: Mutex<Vec<String>>,
}

impl<B: StorageBackend> DryRunBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            planned: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Commands that would have run, in order.
    pub fn planned(&self) -> Vec<String> {
        self.planned
            .lock()
            .map(|planned| planned.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn record(&self, command: String) {
        info!(%command, "[dry-run] skipping");
        match self.planned.lock() {
            Ok(mut planned) => planned.push(command),
            Err(e) => e.into_inner().push(command),
        }
    }
}

#[async_trait]
impl<B: StorageBackend> StorageBackend for DryRunBackend<B> {
    async fn list_children(&self, root: &DatasetPath) -> Result<Vec<InventoryEntry>, ZfsError> {
        self.inner.list_children(root).await
    }

    async fn list_snapshots(&self, dataset: &DatasetPath) -> Result<Vec<SnapshotInfo>, ZfsError> {
        self.inner.list_snapshots(dataset).await
    }

    async fn has_child_datasets(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        self.inner.has_child_datasets(dataset).await
    }

    async fn dataset_exists(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        self.inner.dataset_exists(dataset).await
    }

    async fn create_snapshot(
        &self,
        snapshot: &SnapshotRef,
        recursive: bool,
    ) -> Result<(), ZfsError> {
        let flag = if recursive { " -r" } else { "" };
        self.record(format!("zfs snapshot{} {}", flag, snapshot));
        Ok(())
    }

    async fn rename_dataset(&self, from: &DatasetPath, to: &DatasetPath) -> Result<(), ZfsError> {
        self.record(format!("zfs rename {} {}", from, to));
        Ok(())
    }

    async fn set_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
        value: &str,
    ) -> Result<(), ZfsError> {
        self.record(format!("zfs set {}={} {}", property, value, dataset));
        Ok(())
    }

    async fn inherit_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
    ) -> Result<(), ZfsError> {
        self.record(format!("zfs inherit {} {}", property, dataset));
        Ok(())
    }

    async fn transfer_incremental(
        &self,
        from: &SnapshotRef,
        to: &SnapshotRef,
        dest_root: &DatasetPath,
    ) -> Result<PipeStatus, ZfsError> {
        let command = self.inner.describe_transfer(from, to, dest_root);
        self.record(command.clone());
        Ok(PipeStatus::succeeded(&[command]))
    }

    fn describe_transfer(&self, from: &SnapshotRef, to: &SnapshotRef, dest_root: &DatasetPath) -> String {
        self.inner.describe_transfer(from, to, dest_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn test_mutations_never_reach_inner_backend() {
        let memory = MemoryBackend::new()
            .with_dataset("tank/ROOT", None)
            .unwrap()
            .with_dataset("tank/ROOT/be", None)
            .unwrap();
        let backend = DryRunBackend::new(memory);
        let be = DatasetPath::new("tank/ROOT/be").unwrap();

        backend.set_property(&be, "zoned", "off").await.unwrap();
        backend
            .rename_dataset(&be, &be.with_suffix(".bak"))
            .await
            .unwrap();
        backend
            .create_snapshot(&be.snapshot("boot"), true)
            .await
            .unwrap();

        assert!(backend.inner().mutations().is_empty());
        assert!(backend.inner().contains("tank/ROOT/be"));
        assert_eq!(
            backend.planned(),
            vec![
                "zfs set zoned=off tank/ROOT/be".to_string(),
                "zfs rename tank/ROOT/be tank/ROOT/be.bak".to_string(),
                "zfs snapshot -r tank/ROOT/be@boot".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_reads_pass_through() {
        let memory = MemoryBackend::new()
            .with_dataset("tank/ROOT", None)
            .unwrap()
            .with_dataset("tank/ROOT/be", None)
            .unwrap();
        let backend = DryRunBackend::new(memory);
        let root = DatasetPath::new("tank/ROOT").unwrap();
        assert_eq!(backend.list_children(&root).await.unwrap().len(), 1);
    }
}

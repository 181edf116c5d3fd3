//! Storage backend capability consumed by the reconciliation core.
//!
//! The core never talks to `zfs` directly: inventory, snapshot lookup and
//! every mutation go through [`StorageBackend`]. Implementations:
//!
//! - [`crate::zfs::ZfsBackend`]: the real `zfs` CLI.
//! - [`DryRunBackend`]: passes reads through, turns mutations into logged
//!   no-ops.
//! - [`MemoryBackend`]: an in-memory dataset tree for tests and rehearsals.

pub mod dry_run;
pub mod memory;

use async_trait::async_trait;

use crate::errors::ZfsError;
use crate::models::{DatasetPath, InventoryEntry, SnapshotInfo, SnapshotRef};
use crate::pipeline::PipeStatus;

pub use dry_run::DryRunBackend;
pub use memory::{MemoryBackend, Mutation};

/// Operations the reconciler needs from a snapshot storage engine.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Direct child filesystems of `root` with their clone origin, ordered
    /// by creation time ascending. The root itself is not included.
    async fn list_children(&self, root: &DatasetPath) -> Result<Vec<InventoryEntry>, ZfsError>;

    /// Snapshots of `dataset` (not its descendants), creation time ascending.
    async fn list_snapshots(&self, dataset: &DatasetPath) -> Result<Vec<SnapshotInfo>, ZfsError>;

    /// Whether `dataset` has any descendant filesystems.
    async fn has_child_datasets(&self, dataset: &DatasetPath) -> Result<bool, ZfsError>;

    async fn dataset_exists(&self, dataset: &DatasetPath) -> Result<bool, ZfsError>;

    async fn create_snapshot(&self, snapshot: &SnapshotRef, recursive: bool)
        -> Result<(), ZfsError>;

    async fn rename_dataset(&self, from: &DatasetPath, to: &DatasetPath) -> Result<(), ZfsError>;

    async fn set_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
        value: &str,
    ) -> Result<(), ZfsError>;

    async fn inherit_property(&self, dataset: &DatasetPath, property: &str)
        -> Result<(), ZfsError>;

    /// Send `(from, to]` recursively and receive it under `dest_root`. The
    /// receiver creates the destination branch itself.
    async fn transfer_incremental(
        &self,
        from: &SnapshotRef,
        to: &SnapshotRef,
        dest_root: &DatasetPath,
    ) -> Result<PipeStatus, ZfsError>;

    /// Human-readable rendering of the transfer, used by dry runs.
    fn describe_transfer(&self, from: &SnapshotRef, to: &SnapshotRef, dest_root: &DatasetPath) -> String {
        format!("send -R -I {} {} | receive {}", from, to, dest_root)
    }
}

/// Borrowed backends delegate, so decorators such as [`DryRunBackend`] can
/// wrap a `&dyn StorageBackend`.
#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for &T {
    async fn list_children(&self, root: &DatasetPath) -> Result<Vec<InventoryEntry>, ZfsError> {
        (**self).list_children(root).await
    }

    async fn list_snapshots(&self, dataset: &DatasetPath) -> Result<Vec<SnapshotInfo>, ZfsError> {
        (**self).list_snapshots(dataset).await
    }

    async fn has_child_datasets(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        (**self).has_child_datasets(dataset).await
    }

    async fn dataset_exists(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        (**self).dataset_exists(dataset).await
    }

    async fn create_snapshot(
        &self,
        snapshot: &SnapshotRef,
        recursive: bool,
    ) -> Result<(), ZfsError> {
        (**self).create_snapshot(snapshot, recursive).await
    }

    async fn rename_dataset(&self, from: &DatasetPath, to: &DatasetPath) -> Result<(), ZfsError> {
        (**self).rename_dataset(from, to).await
    }

    async fn set_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
        value: &str,
    ) -> Result<(), ZfsError> {
        (**self).set_property(dataset, property, value).await
    }

    async fn inherit_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
    ) -> Result<(), ZfsError> {
        (**self).inherit_property(dataset, property).await
    }

    async fn transfer_incremental(
        &self,
        from: &SnapshotRef,
        to: &SnapshotRef,
        dest_root: &DatasetPath,
    ) -> Result<PipeStatus, ZfsError> {
        (**self).transfer_incremental(from, to, dest_root).await
    }

    fn describe_transfer(&self, from: &SnapshotRef, to: &SnapshotRef, dest_root: &DatasetPath) -> String {
        (**self).describe_transfer(from, to, dest_root)
    }
}

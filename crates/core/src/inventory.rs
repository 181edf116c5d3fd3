//! Lineage inventory: the immediate children of a root and their origins.

use serde::Serialize;
use tracing::{debug, instrument};

use crate::backend::StorageBackend;
use crate::errors::{InventoryError, ZfsError};
use crate::models::{DatasetPath, InventoryEntry};

/// Snapshot of one root's direct children, in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inventory {
    root: DatasetPath,
    entries: Vec<InventoryEntry>,
}

impl Inventory {
    pub fn new(root: DatasetPath, entries: Vec<InventoryEntry>) -> Self {
        Self { root, entries }
    }

    pub fn root(&self) -> &DatasetPath {
        &self.root
    }

    pub fn entries(&self) -> &[InventoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry whose path relative to the root is exactly `branch`.
    pub fn get(&self, branch: &str) -> Option<&InventoryEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name.relative_to(&self.root) == Some(branch))
    }

    /// Relative names, in inventory order.
    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter_map(|entry| entry.name.relative_to(&self.root))
    }
}

/// List the direct children of `root` together with their clone origin.
///
/// A missing root or an unreachable backend is an [`InventoryError`]; the
/// caller must not touch any branch without a valid inventory.
#[instrument(skip_all, fields(root = %root))]
pub async fn list_immediate_children(
    backend: &dyn StorageBackend,
    root: &DatasetPath,
) -> Result<Inventory, InventoryError> {
    let entries = backend.list_children(root).await.map_err(|e| match e {
        ZfsError::DatasetNotFound(_) => InventoryError::RootMissing(root.to_string()),
        source => InventoryError::Backend {
            root: root.to_string(),
            source,
        },
    })?;

    let entries: Vec<InventoryEntry> = entries
        .into_iter()
        .filter(|entry| entry.name.relative_to(root).is_some())
        .collect();
    debug!(count = entries.len(), "inventoried root");
    Ok(Inventory::new(root.clone(), entries))
}

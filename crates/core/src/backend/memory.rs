//! In-memory dataset tree implementing [`StorageBackend`].
//!
//! Models just enough of ZFS semantics for the reconciler: datasets with a
//! clone origin and properties, snapshots with creation times, recursive
//! rename, and a receive that materializes the destination branch as a clone
//! of the origin's destination-side counterpart. Every mutation is recorded
//! so callers can assert exactly what a run touched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StorageBackend;
use crate::errors::{ModelError, ZfsError};
use crate::models::{DatasetPath, InventoryEntry, Origin, SnapshotInfo, SnapshotRef};
use crate::pipeline::{PipeStatus, StageStatus};

/// A mutation applied to a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateSnapshot {
        snapshot: String,
        recursive: bool,
    },
    Rename {
        from: String,
        to: String,
    },
    SetProperty {
        dataset: String,
        property: String,
        value: String,
    },
    InheritProperty {
        dataset: String,
        property: String,
    },
    Transfer {
        from: String,
        to: String,
        dest_root: String,
    },
}

#[derive(Debug, Clone)]
struct DatasetState {
    origin: Origin,
    created: i64,
    properties: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, DatasetState>,
    snapshots: Vec<SnapshotInfo>,
    clock: i64,
    mutations: Vec<Mutation>,
    failing_transfers: HashMap<String, i32>,
    failing_renames: HashMap<String, i32>,
    failing_listings: HashMap<String, i32>,
    unavailable: bool,
}

impl State {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn require(&self, dataset: &str) -> Result<&DatasetState, ZfsError> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| ZfsError::DatasetNotFound(dataset.to_string()))
    }
}

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    /// Add a dataset. `origin` is a `dataset@label` text or `None` for a
    /// history owner.
    pub fn with_dataset(self, name: &str, origin: Option<&str>) -> Result<Self, ModelError> {
        let name = DatasetPath::new(name)?;
        let origin = Origin::from_property(origin.unwrap_or("-"));
        {
            let mut state = self.lock();
            let created = state.tick();
            state.datasets.insert(
                name.to_string(),
                DatasetState {
                    origin,
                    created,
                    properties: HashMap::new(),
                },
            );
        }
        Ok(self)
    }

    /// Add a snapshot created "now" on the backend clock.
    pub fn with_snapshot(self, snapshot: &str) -> Result<Self, ModelError> {
        let created = self.lock().tick();
        self.with_snapshot_at(snapshot, created)
    }

    /// Add a snapshot with an explicit creation time.
    pub fn with_snapshot_at(self, snapshot: &str, created: i64) -> Result<Self, ModelError> {
        let snapshot = SnapshotRef::parse(snapshot)?;
        {
            let mut state = self.lock();
            state.clock = state.clock.max(created);
            state.snapshots.push(SnapshotInfo { snapshot, created });
        }
        Ok(self)
    }

    pub fn with_property(self, dataset: &str, property: &str, value: &str) -> Self {
        if let Some(ds) = self.lock().datasets.get_mut(dataset) {
            ds.properties.insert(property.to_string(), value.to_string());
        }
        self
    }

    /// Make the transfer whose ending snapshot lives on `dataset` fail in the
    /// buffer stage with `code`.
    pub fn fail_transfer_for(self, dataset: &str, code: i32) -> Self {
        self.lock()
            .failing_transfers
            .insert(dataset.to_string(), code);
        self
    }

    /// Make renaming `dataset` fail with `code`.
    pub fn fail_rename_for(self, dataset: &str, code: i32) -> Self {
        self.lock().failing_renames.insert(dataset.to_string(), code);
        self
    }

    /// Make listing the snapshots of `dataset` fail with `code`.
    pub fn fail_list_snapshots_for(self, dataset: &str, code: i32) -> Self {
        self.lock()
            .failing_listings
            .insert(dataset.to_string(), code);
        self
    }

    /// Make every call fail as if the backend were unreachable.
    pub fn unavailable(self) -> Self {
        self.lock().unavailable = true;
        self
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    pub fn contains(&self, dataset: &str) -> bool {
        self.lock().datasets.contains_key(dataset)
    }

    pub fn origin_of(&self, dataset: &str) -> Option<Origin> {
        self.lock().datasets.get(dataset).map(|ds| ds.origin.clone())
    }

    pub fn property_of(&self, dataset: &str, property: &str) -> Option<String> {
        self.lock()
            .datasets
            .get(dataset)
            .and_then(|ds| ds.properties.get(property).cloned())
    }

    /// Snapshot labels of `dataset`, creation ascending.
    pub fn snapshot_labels(&self, dataset: &str) -> Vec<String> {
        let state = self.lock();
        let mut snaps: Vec<&SnapshotInfo> = state
            .snapshots
            .iter()
            .filter(|info| info.snapshot.dataset.as_str() == dataset)
            .collect();
        snaps.sort_by_key(|info| info.created);
        snaps.iter().map(|info| info.snapshot.label.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the data is
        // still usable for inspection.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(state: &State) -> Result<(), ZfsError> {
        if state.unavailable {
            return Err(ZfsError::CommandFailed {
                command: "zfs".into(),
                exit_code: 1,
                stderr: "backend unavailable".into(),
            });
        }
        Ok(())
    }
}

fn is_descendant(name: &str, ancestor: &str) -> bool {
    name.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list_children(&self, root: &DatasetPath) -> Result<Vec<InventoryEntry>, ZfsError> {
        let state = self.lock();
        Self::check_available(&state)?;
        state.require(root.as_str())?;

        let mut children: Vec<(i64, InventoryEntry)> = state
            .datasets
            .iter()
            .filter_map(|(name, ds)| {
                let path = DatasetPath::new(name.as_str()).ok()?;
                let relative = path.relative_to(root)?;
                (!relative.contains('/')).then(|| {
                    (
                        ds.created,
                        InventoryEntry {
                            name: path.clone(),
                            origin: ds.origin.clone(),
                        },
                    )
                })
            })
            .collect();
        children.sort_by_key(|(created, _)| *created);
        Ok(children.into_iter().map(|(_, entry)| entry).collect())
    }

    async fn list_snapshots(&self, dataset: &DatasetPath) -> Result<Vec<SnapshotInfo>, ZfsError> {
        let state = self.lock();
        Self::check_available(&state)?;
        state.require(dataset.as_str())?;
        if let Some(code) = state.failing_listings.get(dataset.as_str()) {
            return Err(ZfsError::CommandFailed {
                command: format!("zfs list -t snapshot {}", dataset),
                exit_code: *code,
                stderr: "injected listing failure".into(),
            });
        }

        let mut snaps: Vec<SnapshotInfo> = state
            .snapshots
            .iter()
            .filter(|info| &info.snapshot.dataset == dataset)
            .cloned()
            .collect();
        snaps.sort_by_key(|info| info.created);
        Ok(snaps)
    }

    async fn has_child_datasets(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        let state = self.lock();
        Self::check_available(&state)?;
        state.require(dataset.as_str())?;
        Ok(state
            .datasets
            .keys()
            .any(|name| is_descendant(name, dataset.as_str())))
    }

    async fn dataset_exists(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state.datasets.contains_key(dataset.as_str()))
    }

    async fn create_snapshot(
        &self,
        snapshot: &SnapshotRef,
        recursive: bool,
    ) -> Result<(), ZfsError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.require(snapshot.dataset.as_str())?;
        if state.snapshots.iter().any(|info| &info.snapshot == snapshot) {
            return Err(ZfsError::DatasetExists(snapshot.to_string()));
        }

        let created = state.tick();
        let mut targets = vec![snapshot.dataset.clone()];
        if recursive {
            targets.extend(
                state
                    .datasets
                    .keys()
                    .filter(|name| is_descendant(name, snapshot.dataset.as_str()))
                    .filter_map(|name| DatasetPath::new(name.as_str()).ok()),
            );
        }
        for dataset in targets {
            state.snapshots.push(SnapshotInfo {
                snapshot: dataset.snapshot(snapshot.label.clone()),
                created,
            });
        }
        state.mutations.push(Mutation::CreateSnapshot {
            snapshot: snapshot.to_string(),
            recursive,
        });
        debug!(%snapshot, "memory backend: snapshot created");
        Ok(())
    }

    async fn rename_dataset(&self, from: &DatasetPath, to: &DatasetPath) -> Result<(), ZfsError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.require(from.as_str())?;
        if let Some(code) = state.failing_renames.get(from.as_str()) {
            return Err(ZfsError::CommandFailed {
                command: format!("zfs rename {} {}", from, to),
                exit_code: *code,
                stderr: "injected rename failure".into(),
            });
        }
        if state.datasets.contains_key(to.as_str()) {
            return Err(ZfsError::DatasetExists(to.to_string()));
        }

        let moved: Vec<String> = state
            .datasets
            .keys()
            .filter(|name| *name == from.as_str() || is_descendant(name, from.as_str()))
            .cloned()
            .collect();
        for old in moved {
            let new = format!("{}{}", to, &old[from.as_str().len()..]);
            if let Some(ds) = state.datasets.remove(&old) {
                state.datasets.insert(new.clone(), ds);
            }
            let new_path = DatasetPath::new(new)?;
            for info in state
                .snapshots
                .iter_mut()
                .filter(|info| info.snapshot.dataset.as_str() == old)
            {
                info.snapshot.dataset = new_path.clone();
            }
        }
        state.mutations.push(Mutation::Rename {
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }

    async fn set_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
        value: &str,
    ) -> Result<(), ZfsError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let ds = state
            .datasets
            .get_mut(dataset.as_str())
            .ok_or_else(|| ZfsError::DatasetNotFound(dataset.to_string()))?;
        ds.properties.insert(property.to_string(), value.to_string());
        state.mutations.push(Mutation::SetProperty {
            dataset: dataset.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn inherit_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
    ) -> Result<(), ZfsError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let ds = state
            .datasets
            .get_mut(dataset.as_str())
            .ok_or_else(|| ZfsError::DatasetNotFound(dataset.to_string()))?;
        ds.properties.remove(property);
        state.mutations.push(Mutation::InheritProperty {
            dataset: dataset.to_string(),
            property: property.to_string(),
        });
        Ok(())
    }

    async fn transfer_incremental(
        &self,
        from: &SnapshotRef,
        to: &SnapshotRef,
        dest_root: &DatasetPath,
    ) -> Result<PipeStatus, ZfsError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.mutations.push(Mutation::Transfer {
            from: from.to_string(),
            to: to.to_string(),
            dest_root: dest_root.to_string(),
        });

        let commands = vec![
            format!("zfs send -R -I {} {}", from, to),
            "buffer".to_string(),
            format!("zfs receive -u -e {}", dest_root),
        ];
        let fail = |stage: usize, code: i32, stderr: &str| {
            let mut status = PipeStatus::succeeded(&commands);
            status.stages[stage] = StageStatus {
                command: commands[stage].clone(),
                code,
                stderr: stderr.to_string(),
            };
            status
        };

        if let Some(code) = state.failing_transfers.get(to.dataset.as_str()) {
            return Ok(fail(1, *code, "injected buffer failure"));
        }
        if !state.snapshots.iter().any(|info| &info.snapshot == from)
            || !state.snapshots.iter().any(|info| &info.snapshot == to)
        {
            return Ok(fail(0, 1, "incremental source snapshot does not exist"));
        }

        // `receive -e` names the new dataset after the last segment of the
        // sent dataset; the clone origin maps the same way.
        let target = dest_root.join(to.dataset.last_segment())?;
        let origin = dest_root
            .join(from.dataset.last_segment())?
            .snapshot(from.label.clone());
        if state.datasets.contains_key(target.as_str()) {
            return Ok(fail(2, 1, "destination already exists"));
        }
        if !state.snapshots.iter().any(|info| info.snapshot == origin) {
            return Ok(fail(2, 1, "origin snapshot missing on destination"));
        }

        let received: Vec<SnapshotInfo> = state
            .snapshots
            .iter()
            .filter(|info| {
                info.snapshot.dataset == to.dataset
                    && state
                        .snapshots
                        .iter()
                        .find(|end| &end.snapshot == to)
                        .is_some_and(|end| info.created <= end.created)
            })
            .map(|info| SnapshotInfo {
                snapshot: target.snapshot(info.snapshot.label.clone()),
                created: info.created,
            })
            .collect();

        let created = state.tick();
        state.datasets.insert(
            target.to_string(),
            DatasetState {
                origin: Origin::Snapshot(origin),
                created,
                properties: HashMap::new(),
            },
        );
        state.snapshots.extend(received);
        debug!(%target, "memory backend: received branch");
        Ok(PipeStatus::succeeded(&commands))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(s: &str) -> DatasetPath {
        DatasetPath::new(s).unwrap()
    }

    fn snap(s: &str) -> SnapshotRef {
        SnapshotRef::parse(s).unwrap()
    }

    fn tree() -> MemoryBackend {
        MemoryBackend::new()
            .with_dataset("src/ROOT", None)
            .unwrap()
            .with_dataset("src/ROOT/a", None)
            .unwrap()
            .with_snapshot("src/ROOT/a@s1")
            .unwrap()
            .with_dataset("src/ROOT/b", Some("src/ROOT/a@s1"))
            .unwrap()
            .with_dataset("src/ROOT/b/nested", None)
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_children_is_direct_and_ordered() {
        let backend = tree();
        let children = backend.list_children(&ds("src/ROOT")).await.unwrap();
        let names: Vec<&str> = children.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["src/ROOT/a", "src/ROOT/b"]);
        assert_eq!(children[1].origin, Origin::Snapshot(snap("src/ROOT/a@s1")));
    }

    #[tokio::test]
    async fn test_missing_root() {
        let backend = tree();
        let err = backend.list_children(&ds("nope")).await.unwrap_err();
        assert!(matches!(err, ZfsError::DatasetNotFound(_)));
    }

    #[tokio::test]
    async fn test_rename_moves_descendants_and_snapshots() {
        let backend = tree().with_snapshot("src/ROOT/b@x").unwrap();
        backend
            .rename_dataset(&ds("src/ROOT/b"), &ds("src/ROOT/b.bak"))
            .await
            .unwrap();
        assert!(!backend.contains("src/ROOT/b"));
        assert!(backend.contains("src/ROOT/b.bak"));
        assert!(backend.contains("src/ROOT/b.bak/nested"));
        assert_eq!(backend.snapshot_labels("src/ROOT/b.bak"), vec!["x"]);
        assert_eq!(backend.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let backend = tree();
        let err = backend
            .rename_dataset(&ds("src/ROOT/b"), &ds("src/ROOT/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ZfsError::DatasetExists(_)));
    }

    #[tokio::test]
    async fn test_has_child_datasets() {
        let backend = tree();
        assert!(backend.has_child_datasets(&ds("src/ROOT/b")).await.unwrap());
        assert!(!backend.has_child_datasets(&ds("src/ROOT/a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_transfer_creates_clone_on_destination() {
        let backend = tree()
            .with_snapshot("src/ROOT/b@t1")
            .unwrap()
            .with_dataset("dst/ROOT", None)
            .unwrap()
            .with_dataset("dst/ROOT/a", None)
            .unwrap()
            .with_snapshot("dst/ROOT/a@s1")
            .unwrap();

        let status = backend
            .transfer_incremental(&snap("src/ROOT/a@s1"), &snap("src/ROOT/b@t1"), &ds("dst/ROOT"))
            .await
            .unwrap();
        assert!(status.success());
        assert_eq!(
            backend.origin_of("dst/ROOT/b"),
            Some(Origin::Snapshot(snap("dst/ROOT/a@s1")))
        );
        assert_eq!(backend.snapshot_labels("dst/ROOT/b"), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_injected_transfer_failure_is_middle_stage() {
        let backend = tree()
            .with_snapshot("src/ROOT/b@t1")
            .unwrap()
            .fail_transfer_for("src/ROOT/b", 7);
        let status = backend
            .transfer_incremental(&snap("src/ROOT/a@s1"), &snap("src/ROOT/b@t1"), &ds("dst/ROOT"))
            .await
            .unwrap();
        assert_eq!(status.stages[0].code, 0);
        assert_eq!(status.stages[1].code, 7);
        assert_eq!(status.stages[2].code, 0);
        assert_eq!(status.code(), 7);
    }
}

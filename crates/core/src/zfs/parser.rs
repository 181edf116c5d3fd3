//! Parsers for `zfs list -H -p` output.
//!
//! `-H` gives one record per line with tab-separated fields and no header;
//! `-p` gives raw numeric values (creation time in epoch seconds).

use tracing::{debug, warn};

use crate::errors::ZfsError;
use crate::models::{DatasetPath, InventoryEntry, Origin, SnapshotInfo, SnapshotRef};

/// Parse `zfs list -H -p -d 1 -t filesystem -o name,origin -s creation <root>`.
///
/// The root's own line is dropped, as is anything not strictly below it.
pub fn parse_children(output: &str, root: &DatasetPath) -> Result<Vec<InventoryEntry>, ZfsError> {
    debug!("parsing zfs children listing ({} bytes)", output.len());
    let mut entries = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [name, origin] = fields.as_slice() else {
            return Err(ZfsError::ParseError(format!(
                "expected name<TAB>origin, got '{}'",
                line
            )));
        };
        let name = DatasetPath::new(*name)?;
        match name.relative_to(root) {
            Some(relative) if !relative.contains('/') => entries.push(InventoryEntry {
                name,
                origin: Origin::from_property(origin),
            }),
            Some(_) => warn!(dataset = %name, "ignoring nested dataset in depth-1 listing"),
            None => {}
        }
    }
    debug!(count = entries.len(), "parsed inventory entries");
    Ok(entries)
}

/// Parse `zfs list -H -p -d 1 -t snapshot -o name,creation -s creation <ds>`.
pub fn parse_snapshots(output: &str) -> Result<Vec<SnapshotInfo>, ZfsError> {
    let mut snapshots = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [name, creation] = fields.as_slice() else {
            return Err(ZfsError::ParseError(format!(
                "expected name<TAB>creation, got '{}'",
                line
            )));
        };
        let snapshot = SnapshotRef::parse(name)?;
        let created = creation.trim().parse::<i64>().map_err(|_| {
            ZfsError::ParseError(format!("bad creation time '{}' for {}", creation, name))
        })?;
        snapshots.push(SnapshotInfo { snapshot, created });
    }
    debug!(count = snapshots.len(), "parsed snapshots");
    Ok(snapshots)
}

/// Parse a single-column `-o name` listing.
pub fn parse_names(output: &str) -> Result<Vec<DatasetPath>, ZfsError> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| DatasetPath::new(l).map_err(ZfsError::from))
        .collect()
}

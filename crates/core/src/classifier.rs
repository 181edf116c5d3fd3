//! Branch classifier: which destination entries are reconciliation candidates.

use std::collections::HashSet;

use tracing::debug;

use crate::inventory::Inventory;

/// Relative branch names to attempt, in inventory order.
///
/// The structural container (`container_name`, e.g. `ROOT`) is never a
/// branch, and neither are this tool's own `<branch><backup_suffix>` copies.
pub fn candidate_branches(
    dest_inventory: &Inventory,
    container_name: &str,
    backup_suffix: &str,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for entry in dest_inventory.entries() {
        let Some(branch) = entry.name.relative_to(dest_inventory.root()) else {
            continue;
        };
        if entry.name.last_segment() == container_name {
            debug!(dataset = %entry.name, "skipping structural container");
            continue;
        }
        if !backup_suffix.is_empty() && branch.ends_with(backup_suffix) {
            debug!(dataset = %entry.name, "skipping backup copy");
            continue;
        }
        if seen.insert(branch.to_string()) {
            candidates.push(branch.to_string());
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetPath, InventoryEntry, Origin};

    fn inventory(root: &str, names: &[&str]) -> Inventory {
        let root = DatasetPath::new(root).unwrap();
        let entries = names
            .iter()
            .map(|name| InventoryEntry {
                name: root.join(name).unwrap(),
                origin: Origin::None,
            })
            .collect();
        Inventory::new(root, entries)
    }

    #[test]
    fn test_excludes_container_and_backups() {
        let inv = inventory("backup/zones/z1", &["ROOT", "zbe-60", "zbe-59.bak", "zbe-59"]);
        assert_eq!(
            candidate_branches(&inv, "ROOT", ".bak"),
            vec!["zbe-60".to_string(), "zbe-59".to_string()]
        );
    }

    #[test]
    fn test_preserves_order_and_dedups() {
        let inv = inventory("b/ROOT", &["c", "a", "c", "b"]);
        assert_eq!(candidate_branches(&inv, "ROOT", ".bak"), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_empty_inventory() {
        let inv = inventory("b/ROOT", &[]);
        assert!(candidate_branches(&inv, "ROOT", ".bak").is_empty());
    }
}

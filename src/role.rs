//! C5 - Role Coordinator.
//!
//! `role_update` is the spec §4.5 step that runs once per node, independent
//! of sync: it compares which side of a link this node is on against the
//! readonly state its datasets are currently in, and flips mount/readonly/
//! service-mutability state when they disagree. Ported from
//! `ReplicationBaseTask.set_datasets_readonly`/`get_parent_datasets` in the
//! original dispatcher plugin.

use std::collections::HashSet;

use crate::error::EngineError;
use crate::inventory::{Dataset, LocalZfs};
use crate::link::ReplicationLink;
use crate::services::ServiceRegistry;

/// The minimal covering set of datasets to `mount`/`unmount`: children of
/// an already-selected parent are dropped, since mounting/unmounting the
/// parent (optionally recursively) already covers them. Ported from
/// `get_parent_datasets`, sorting by `(len, lexical)` so the shortest
/// names are considered first.
pub fn parent_datasets(dataset_names: &[String]) -> Vec<String> {
    let mut sorted: Vec<String> = dataset_names.to_vec();
    sorted.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let mut removed: HashSet<String> = HashSet::new();
    let mut parents = Vec::new();
    for name in &sorted {
        if removed.contains(name) {
            continue;
        }
        parents.push(name.clone());
        let prefix = format!("{name}/");
        for other in &sorted {
            if other.starts_with(&prefix) {
                removed.insert(other.clone());
            }
        }
    }
    parents
}

/// Applies the role a link implies for this node to its local datasets.
/// `datasets` is this node's current inventory (spec §4.5): used to read
/// the datasets' present readonly state, which this function compares
/// against where the node should be (master ⇒ writable, slave ⇒ readonly)
/// to decide whether anything needs to change.
pub async fn role_update(
    link: &ReplicationLink,
    local_ips: &[String],
    datasets: &[Dataset],
    services: &dyn ServiceRegistry,
) -> Result<(), EngineError> {
    let is_master_here = link.is_master_here(local_ips);

    let Some(first_name) = link.datasets.first() else {
        return Ok(());
    };
    let Some(first) = datasets.iter().find(|d| &d.name == first_name) else {
        return Err(EngineError::Datastore(format!(
            "dataset {first_name:?} not found locally during role update"
        )));
    };
    let current_readonly = first.readonly;

    // Master should be writable (readonly=false), slave should be
    // readonly=true. `current_readonly` already matches that target
    // exactly when it differs from `is_master_here`; nothing to flip.
    if is_master_here != current_readonly {
        return Ok(());
    }

    let target_readonly = !is_master_here;
    let parents = parent_datasets(&link.datasets);

    if target_readonly {
        // Demoting to slave: unmount first, then lock.
        for parent in &parents {
            LocalZfs::unmount(parent, link.recursive).await?;
        }
        for dataset in &link.datasets {
            LocalZfs::set_readonly(dataset, true).await?;
        }
    } else {
        // Promoting to master: unlock first, then mount.
        for dataset in &link.datasets {
            LocalZfs::set_readonly(dataset, false).await?;
        }
        for parent in &parents {
            LocalZfs::mount(parent).await?;
        }
    }

    for service in services.related(&link.datasets).await? {
        services.set_immutable(&service, target_readonly).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_datasets_drops_descendants_of_a_selected_parent() {
        let names = vec![
            "tank/a".to_string(),
            "tank/a/b".to_string(),
            "tank/a/b/c".to_string(),
            "tank/z".to_string(),
        ];
        let parents = parent_datasets(&names);
        assert_eq!(parents, vec!["tank/a".to_string(), "tank/z".to_string()]);
    }

    #[test]
    fn parent_datasets_keeps_unrelated_siblings() {
        let names = vec!["tank/a".to_string(), "tank/b".to_string()];
        let parents = parent_datasets(&names);
        assert_eq!(parents, vec!["tank/a".to_string(), "tank/b".to_string()]);
    }

    #[test]
    fn parent_datasets_is_order_independent() {
        let a = vec!["tank/a/b".to_string(), "tank/a".to_string()];
        let b = vec!["tank/a".to_string(), "tank/a/b".to_string()];
        assert_eq!(parent_datasets(&a), parent_datasets(&b));
    }
}

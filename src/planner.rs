//! C2 - Delta Planner.
//!
//! A pure function (no I/O, no wall clock) that compares a local and a
//! remote inventory and emits the ordered `ReplicationAction` list plus a
//! total send-size estimate, per `ReplicationPlugin.py::
//! CalculateReplicationDeltaTask.run` ported 1:1 to the steps in spec §4.2.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::inventory::{Dataset, Snapshot};

/// One step of a replication plan (spec §3). All variants carry the local
/// and remote filesystem paths they operate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationAction {
    SendStream {
        localfs: String,
        remotefs: String,
        incremental: bool,
        anchor: Option<String>,
        snapshot: String,
        send_size: u64,
    },
    DeleteSnapshots {
        localfs: String,
        remotefs: String,
        snapshots: Vec<String>,
    },
    ClearSnapshots {
        localfs: String,
        remotefs: String,
    },
    DeleteDataset {
        localfs: String,
        remotefs: String,
    },
}

impl ReplicationAction {
    pub fn localfs(&self) -> &str {
        match self {
            ReplicationAction::SendStream { localfs, .. }
            | ReplicationAction::DeleteSnapshots { localfs, .. }
            | ReplicationAction::ClearSnapshots { localfs, .. }
            | ReplicationAction::DeleteDataset { localfs, .. } => localfs,
        }
    }

    pub fn remotefs(&self) -> &str {
        match self {
            ReplicationAction::SendStream { remotefs, .. }
            | ReplicationAction::DeleteSnapshots { remotefs, .. }
            | ReplicationAction::ClearSnapshots { remotefs, .. }
            | ReplicationAction::DeleteDataset { remotefs, .. } => remotefs,
        }
    }

    /// Human-readable description for progress reporting (spec §4.3).
    pub fn describe(&self) -> String {
        match self {
            ReplicationAction::SendStream {
                localfs,
                snapshot,
                incremental,
                ..
            } => format!(
                "Sending {} stream of snapshot {localfs}@{snapshot}",
                if *incremental { "incremental" } else { "full" }
            ),
            ReplicationAction::DeleteSnapshots { remotefs, .. } => {
                format!("Removing snapshots on remote dataset {remotefs}")
            }
            ReplicationAction::ClearSnapshots { remotefs, .. } => {
                format!("Clearing all snapshots on remote dataset {remotefs}")
            }
            ReplicationAction::DeleteDataset { remotefs, .. } => {
                format!("Removing remote dataset {remotefs}")
            }
        }
    }
}

fn is_descendant(name: &str, root: &str, recursive: bool) -> bool {
    if recursive {
        name == root || name.starts_with(&format!("{root}/"))
    } else {
        name == root
    }
}

fn mirror_path(name: &str, from_root: &str, to_root: &str) -> String {
    format!("{to_root}{}", &name[from_root.len()..])
}

fn sorted_snaps<'a>(snapshots: &'a [Snapshot], dataset: &str) -> Vec<&'a Snapshot> {
    let mut snaps: Vec<&Snapshot> = snapshots.iter().filter(|s| s.dataset == dataset).collect();
    snaps.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.snapshot_name.cmp(&b.snapshot_name))
    });
    snaps
}

fn push_full_chain(actions: &mut Vec<ReplicationAction>, localfs: &str, remotefs: &str, snaps: &[&Snapshot]) {
    for (idx, snap) in snaps.iter().enumerate() {
        actions.push(ReplicationAction::SendStream {
            localfs: localfs.to_string(),
            remotefs: remotefs.to_string(),
            incremental: idx > 0,
            anchor: (idx > 0).then(|| snaps[idx - 1].snapshot_name.clone()),
            snapshot: snap.snapshot_name.clone(),
            send_size: 0,
        });
    }
}

/// Pure delta planner (spec §4.2). `estimate` stands in for
/// `estimate_send(dataset, from, to)`; passing it as a closure rather than
/// performing I/O inside `plan` is what keeps this function total and
/// property-testable.
pub fn plan(
    local_ds: &str,
    remote_ds: &str,
    local_datasets: &[Dataset],
    remote_datasets: &[Dataset],
    local_snapshots: &[Snapshot],
    remote_snapshots: &[Snapshot],
    recursive: bool,
    follow_delete: bool,
    estimate: &dyn Fn(&str, Option<&str>, &str) -> u64,
) -> (Vec<ReplicationAction>, u64) {
    let mut local_fs: Vec<&str> = local_datasets
        .iter()
        .map(|d| d.name.as_str())
        .filter(|n| is_descendant(n, local_ds, recursive))
        .collect();
    local_fs.sort_unstable();
    local_fs.dedup();

    let mut remote_fs: Vec<&str> = remote_datasets
        .iter()
        .map(|d| d.name.as_str())
        .filter(|n| is_descendant(n, remote_ds, true))
        .collect();
    remote_fs.sort_unstable();
    remote_fs.dedup();

    let local_fs_set: HashSet<&str> = local_fs.iter().copied().collect();

    let mut actions = Vec::new();

    for &l in &local_fs {
        let r = mirror_path(l, local_ds, remote_ds);
        let l_snaps = sorted_snaps(local_snapshots, l);
        let r_snaps = sorted_snaps(remote_snapshots, &r);

        if r_snaps.is_empty() {
            push_full_chain(&mut actions, l, &r, &l_snaps);
            continue;
        }

        let base = l_snaps
            .iter()
            .enumerate()
            .filter(|(_, ls)| {
                r_snaps
                    .iter()
                    .any(|rs| rs.snapshot_name == ls.snapshot_name && rs.created_at == ls.created_at)
            })
            .max_by(|(_, a), (_, b)| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.snapshot_name.cmp(&b.snapshot_name))
            });

        match base {
            Some((base_idx, _)) => {
                if follow_delete {
                    let local_names: HashSet<&str> =
                        l_snaps.iter().map(|s| s.snapshot_name.as_str()).collect();
                    let mut missing: Vec<&Snapshot> = r_snaps
                        .iter()
                        .filter(|rs| !local_names.contains(rs.snapshot_name.as_str()))
                        .copied()
                        .collect();
                    missing.sort_by(|a, b| {
                        a.created_at
                            .cmp(&b.created_at)
                            .then_with(|| a.snapshot_name.cmp(&b.snapshot_name))
                    });
                    if !missing.is_empty() {
                        actions.push(ReplicationAction::DeleteSnapshots {
                            localfs: l.to_string(),
                            remotefs: r.clone(),
                            snapshots: missing.iter().map(|s| s.snapshot_name.clone()).collect(),
                        });
                    }
                }

                for idx in (base_idx + 1)..l_snaps.len() {
                    actions.push(ReplicationAction::SendStream {
                        localfs: l.to_string(),
                        remotefs: r.clone(),
                        incremental: true,
                        anchor: Some(l_snaps[idx - 1].snapshot_name.clone()),
                        snapshot: l_snaps[idx].snapshot_name.clone(),
                        send_size: 0,
                    });
                }
            }
            None => {
                actions.push(ReplicationAction::ClearSnapshots {
                    localfs: l.to_string(),
                    remotefs: r.clone(),
                });
                push_full_chain(&mut actions, l, &r, &l_snaps);
            }
        }
    }

    for &rfs in &remote_fs {
        let lfs = mirror_path(rfs, remote_ds, local_ds);
        if !local_fs_set.contains(lfs.as_str()) {
            actions.push(ReplicationAction::DeleteDataset {
                localfs: lfs,
                remotefs: rfs.to_string(),
            });
        }
    }

    let mut total = 0u64;
    for action in actions.iter_mut() {
        if let ReplicationAction::SendStream {
            localfs,
            anchor,
            snapshot,
            send_size,
            ..
        } = action
        {
            let size = estimate(localfs, anchor.as_deref(), snapshot);
            *send_size = size;
            total += size;
        }
    }

    (actions, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str) -> Dataset {
        Dataset {
            name: name.to_string(),
            pool: Dataset::from_name(name),
            mountpoint: None,
            readonly: false,
            encrypted: false,
            guid: "g".to_string(),
        }
    }

    fn snap(dataset: &str, name: &str, created_at: i64) -> Snapshot {
        Snapshot {
            dataset: dataset.to_string(),
            snapshot_name: name.to_string(),
            guid: None,
            created_at,
            replicable: true,
            lifetime: 0,
        }
    }

    fn no_estimate() -> impl Fn(&str, Option<&str>, &str) -> u64 {
        |_, _, _| 0
    }

    fn fixed_estimate(n: u64) -> impl Fn(&str, Option<&str>, &str) -> u64 {
        move |_, _, _| n
    }

    #[test]
    fn determinism() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let lsnaps = vec![snap("tank/a", "s1", 100)];
        let rsnaps = vec![];

        let (a1, s1) = plan("tank/a", "pool/a", &local, &remote, &lsnaps, &rsnaps, false, false, &no_estimate());
        let (a2, s2) = plan("tank/a", "pool/a", &local, &remote, &lsnaps, &rsnaps, false, false, &no_estimate());
        assert_eq!(a1, a2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn idempotence_under_no_change() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![snap("tank/a", "s1", 100)];
        let snaps_r = vec![snap("pool/a", "s1", 100)];

        let (actions, size) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, false, false, &no_estimate(),
        );
        assert!(actions.is_empty());
        assert_eq!(size, 0);
    }

    #[test]
    fn forward_progress() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![snap("tank/a", "s1", 100), snap("tank/a", "s2", 200)];
        let snaps_r = vec![snap("pool/a", "s1", 100)];

        let (actions, _) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, false, false, &no_estimate(),
        );
        let sends: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, ReplicationAction::SendStream { .. }))
            .collect();
        assert_eq!(sends.len(), 1);
        match sends[0] {
            ReplicationAction::SendStream {
                snapshot, incremental, anchor, ..
            } => {
                assert_eq!(snapshot, "s2");
                assert!(incremental);
                assert_eq!(anchor.as_deref(), Some("s1"));
            }
            _ => unreachable!(),
        }
    }

    /// Scenario 1: fresh lineage, recursive.
    #[test]
    fn scenario_fresh_lineage_recursive() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![snap("tank/a", "auto-1", 1000), snap("tank/a", "auto-2", 2000)];
        let snaps_r = vec![];

        let (actions, size) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, true, false, &fixed_estimate(10),
        );

        assert_eq!(
            actions,
            vec![
                ReplicationAction::SendStream {
                    localfs: "tank/a".into(),
                    remotefs: "pool/a".into(),
                    incremental: false,
                    anchor: None,
                    snapshot: "auto-1".into(),
                    send_size: 10,
                },
                ReplicationAction::SendStream {
                    localfs: "tank/a".into(),
                    remotefs: "pool/a".into(),
                    incremental: true,
                    anchor: Some("auto-1".into()),
                    snapshot: "auto-2".into(),
                    send_size: 10,
                },
            ]
        );
        assert_eq!(size, 20);
    }

    /// Scenario 2: incremental catch-up.
    #[test]
    fn scenario_incremental_catch_up() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![
            snap("tank/a", "s1", 100),
            snap("tank/a", "s2", 200),
            snap("tank/a", "s3", 300),
        ];
        let snaps_r = vec![snap("pool/a", "s1", 100), snap("pool/a", "s2", 200)];

        let (actions, _) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, false, false, &no_estimate(),
        );

        assert_eq!(
            actions,
            vec![ReplicationAction::SendStream {
                localfs: "tank/a".into(),
                remotefs: "pool/a".into(),
                incremental: true,
                anchor: Some("s2".into()),
                snapshot: "s3".into(),
                send_size: 0,
            }]
        );
    }

    /// Scenario 3: divergence, follow-delete on.
    #[test]
    fn scenario_divergence_follow_delete() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![snap("tank/a", "s1", 100), snap("tank/a", "s3", 300)];
        let snaps_r = vec![snap("pool/a", "s1", 100), snap("pool/a", "s2", 200)];

        let (actions, _) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, false, true, &no_estimate(),
        );

        assert_eq!(
            actions,
            vec![
                ReplicationAction::DeleteSnapshots {
                    localfs: "tank/a".into(),
                    remotefs: "pool/a".into(),
                    snapshots: vec!["s2".into()],
                },
                ReplicationAction::SendStream {
                    localfs: "tank/a".into(),
                    remotefs: "pool/a".into(),
                    incremental: true,
                    anchor: Some("s1".into()),
                    snapshot: "s3".into(),
                    send_size: 0,
                },
            ]
        );
    }

    /// Scenario 4: no common base, follow-delete off.
    #[test]
    fn scenario_no_common_base() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![snap("tank/a", "s9", 900)];
        let snaps_r = vec![snap("pool/a", "s5", 500)];

        let (actions, _) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, false, false, &no_estimate(),
        );

        assert_eq!(
            actions,
            vec![
                ReplicationAction::ClearSnapshots {
                    localfs: "tank/a".into(),
                    remotefs: "pool/a".into(),
                },
                ReplicationAction::SendStream {
                    localfs: "tank/a".into(),
                    remotefs: "pool/a".into(),
                    incremental: false,
                    anchor: None,
                    snapshot: "s9".into(),
                    send_size: 0,
                },
            ]
        );
    }

    /// Scenario 5: obsolete mirror dataset.
    #[test]
    fn scenario_obsolete_mirror_dataset() {
        let local = vec![ds("tank"), ds("tank/a")];
        let remote = vec![ds("pool"), ds("pool/a"), ds("pool/b")];

        let (actions, _) = plan(
            "tank", "pool", &local, &remote, &[], &[], true, false, &no_estimate(),
        );

        let last = actions.last().unwrap();
        assert_eq!(
            last,
            &ReplicationAction::DeleteDataset {
                localfs: "tank/b".into(),
                remotefs: "pool/b".into(),
            }
        );
    }

    #[test]
    fn lineage_invariant_holds_across_chain() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![
            snap("tank/a", "s1", 100),
            snap("tank/a", "s2", 200),
            snap("tank/a", "s3", 300),
        ];
        let snaps_r = vec![snap("pool/a", "s1", 100)];

        let (actions, _) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, false, false, &no_estimate(),
        );

        let sends: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ReplicationAction::SendStream { anchor, snapshot, .. } => Some((anchor.clone(), snapshot.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            sends,
            vec![
                (Some("s1".to_string()), "s2".to_string()),
                (Some("s2".to_string()), "s3".to_string()),
            ]
        );
    }

    #[test]
    fn no_mixed_lineage_clear_and_full_send_coexist_only_together() {
        let local = vec![ds("tank/a")];
        let remote = vec![ds("pool/a")];
        let snaps_l = vec![snap("tank/a", "s9", 900)];
        let snaps_r = vec![snap("pool/a", "s5", 500)];

        let (actions, _) = plan(
            "tank/a", "pool/a", &local, &remote, &snaps_l, &snaps_r, false, false, &no_estimate(),
        );

        let has_clear = actions
            .iter()
            .any(|a| matches!(a, ReplicationAction::ClearSnapshots { .. }));
        let first_send_is_full = matches!(
            actions.iter().find(|a| matches!(a, ReplicationAction::SendStream { .. })),
            Some(ReplicationAction::SendStream { incremental: false, .. })
        );
        assert_eq!(has_clear, first_send_is_full);
    }
}

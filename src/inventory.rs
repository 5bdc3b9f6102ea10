//! C1 - Snapshot/Dataset Inventory Adapter.
//!
//! Read-only queries into the local ZFS backend, driven the same way the
//! teacher drives `zfs`: spawn the binary, parse tab-delimited `-H`
//! output. Mutating subtasks (`create_snapshot`, `destroy`, ...) live here
//! too since they're still "local ZFS", just not read-only.

use tokio::process::Command;

use crate::error::ZfsError;
use crate::naming::SnapshotProperties;

/// A ZFS filesystem or volume, addressed by `pool[/child]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub pool: String,
    pub mountpoint: Option<String>,
    pub readonly: bool,
    pub encrypted: bool,
    pub guid: String,
}

impl Dataset {
    pub fn from_name(name: &str) -> String {
        name.split('/').next().unwrap_or(name).to_string()
    }
}

/// A normalized snapshot record (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub dataset: String,
    pub snapshot_name: String,
    pub guid: Option<String>,
    pub created_at: i64,
    pub replicable: bool,
    pub lifetime: u64,
}

/// `zfs` invocations that read or mutate the local pool, one thin wrapper
/// per subtask named in spec §6.
pub struct LocalZfs;

impl LocalZfs {
    /// `root` plus descendants if `recursive`, each with user properties
    /// expanded. One `zfs list` call: a single listing is a consistent
    /// point-in-time snapshot of metadata.
    pub async fn list_datasets(root: &str, recursive: bool) -> Result<Vec<Dataset>, ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("list")
            .arg("-H")
            .arg("-p")
            .arg("-o")
            .arg("name,mountpoint,readonly,encryption,guid")
            .arg("-t")
            .arg("filesystem,volume");
        if recursive {
            cmd.arg("-r");
        } else {
            cmd.arg("-d").arg("0");
        }
        cmd.arg(root);

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ZfsError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut datasets = Vec::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 5 {
                continue;
            }
            let name = fields[0].to_string();
            if recursive && !(name == root || name.starts_with(&format!("{root}/"))) {
                continue;
            }
            datasets.push(Dataset {
                pool: Dataset::from_name(&name),
                mountpoint: (fields[1] != "none" && fields[1] != "-").then(|| fields[1].to_string()),
                readonly: fields[2] == "on",
                encrypted: fields[3] != "off",
                guid: fields[4].to_string(),
                name,
            });
        }
        Ok(datasets)
    }

    /// All snapshots under `root`, including descendants.
    pub async fn list_snapshots(root: &str) -> Result<Vec<Snapshot>, ZfsError> {
        let output = Command::new("zfs")
            .arg("list")
            .arg("-H")
            .arg("-p")
            .arg("-o")
            .arg(
                "name,creation,org.freenas:uuid,org.freenas:replicate,org.freenas:lifetime",
            )
            .arg("-t")
            .arg("snapshot")
            .arg("-r")
            .arg(root)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ZfsError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut snapshots = Vec::new();
        for line in stdout.lines() {
            if let Some(snap) = parse_snapshot_line(line) {
                snapshots.push(snap);
            }
        }
        Ok(snapshots)
    }

    /// Bytes estimate for a full or incremental send, via `zfs send -n -P`.
    pub async fn estimate_send_size(
        dataset: &str,
        from: Option<&str>,
        to: &str,
    ) -> Result<u64, ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("send").arg("-n").arg("-P");
        if let Some(from) = from {
            cmd.arg("-i").arg(from);
        }
        cmd.arg(format!("{dataset}@{to}"));

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ZfsError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(rest) = line.strip_prefix("size") {
                if let Some(value) = rest.split_whitespace().next() {
                    return value
                        .parse()
                        .map_err(|_| ZfsError::ParseFailed(line.to_string()));
                }
            }
        }
        Err(ZfsError::ParseFailed(
            "no size line in zfs send -n -P output".to_string(),
        ))
    }

    pub async fn create_snapshot(
        dataset: &str,
        name: &str,
        recursive: bool,
        properties: &SnapshotProperties,
    ) -> Result<(), ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("snapshot");
        if recursive {
            cmd.arg("-r");
        }
        for (k, v) in properties.as_zfs_properties() {
            cmd.arg("-o").arg(format!("{k}={v}"));
        }
        cmd.arg(format!("{dataset}@{name}"));

        run_status(cmd).await
    }

    /// `snapshots = None` means "all snapshots of `dataset`" (what
    /// `ClearSnapshots` passes); `Some(names)` destroys exactly those.
    pub async fn delete_multiple_snapshots(
        dataset: &str,
        snapshots: Option<&[String]>,
    ) -> Result<(), ZfsError> {
        let selector = match snapshots {
            None => "%".to_string(),
            Some(names) if names.is_empty() => return Ok(()),
            Some(names) => names.join(","),
        };

        let mut cmd = Command::new("zfs");
        cmd.arg("destroy").arg(format!("{dataset}@{selector}"));
        run_status(cmd).await
    }

    pub async fn destroy(_pool: &str, dataset: &str) -> Result<(), ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("destroy").arg("-r").arg(dataset);
        run_status(cmd).await
    }

    pub async fn set_readonly(dataset: &str, readonly: bool) -> Result<(), ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("set")
            .arg(format!("readonly={}", if readonly { "on" } else { "off" }))
            .arg(dataset);
        run_status(cmd).await
    }

    pub async fn mount(dataset: &str) -> Result<(), ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("mount").arg(dataset);
        run_status(cmd).await
    }

    pub async fn unmount(dataset: &str, recursive: bool) -> Result<(), ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("unmount");
        if recursive {
            cmd.arg("-r");
        }
        cmd.arg(dataset);
        run_status(cmd).await
    }

    pub async fn send(
        dataset: &str,
        anchor: Option<&str>,
        snapshot: &str,
    ) -> Result<tokio::process::Child, ZfsError> {
        let mut cmd = Command::new("zfs");
        cmd.arg("send");
        if let Some(anchor) = anchor {
            cmd.arg("-i").arg(anchor);
        }
        cmd.arg(format!("{dataset}@{snapshot}"));
        cmd.stdout(std::process::Stdio::piped());
        cmd.spawn().map_err(ZfsError::SpawnFailed)
    }
}

async fn run_status(mut cmd: Command) -> Result<(), ZfsError> {
    let status = cmd.status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(ZfsError::CommandFailed(format!(
            "zfs command exited with {status}"
        )))
    }
}

fn parse_snapshot_line(line: &str) -> Option<Snapshot> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 5 {
        return None;
    }
    let (dataset, snapshot_name) = fields[0].split_once('@')?;
    let created_at: i64 = fields[1].parse().ok()?;
    let guid = none_if_dash(fields[2]);
    let replicable = fields[3] == "yes";
    let lifetime = fields[4].parse().unwrap_or(0);

    Some(Snapshot {
        dataset: dataset.to_string(),
        snapshot_name: snapshot_name.to_string(),
        guid,
        created_at,
        replicable,
        lifetime,
    })
}

fn none_if_dash(s: &str) -> Option<String> {
    if s == "-" || s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_snapshot_line() {
        let line = "tank/a@auto-1\t1000\tuuid-1\tyes\t3600";
        let snap = parse_snapshot_line(line).unwrap();
        assert_eq!(snap.dataset, "tank/a");
        assert_eq!(snap.snapshot_name, "auto-1");
        assert_eq!(snap.created_at, 1000);
        assert_eq!(snap.guid.as_deref(), Some("uuid-1"));
        assert!(snap.replicable);
        assert_eq!(snap.lifetime, 3600);
    }

    #[test]
    fn parses_dash_guid_as_none() {
        let line = "tank/a@auto-1\t1000\t-\tno\t0";
        let snap = parse_snapshot_line(line).unwrap();
        assert_eq!(snap.guid, None);
        assert!(!snap.replicable);
    }
}

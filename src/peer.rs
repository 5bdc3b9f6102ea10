//! The `RemotePeer` boundary: everything this engine needs from the other
//! appliance in a link, behind one narrow trait. The real RPC/WebSocket
//! transport, auth, and task-queue framework that a production deployment
//! wires this to are explicitly out of scope (spec §1): this module only
//! specifies the contract and ships an in-process `LoopbackPeer` useful for
//! single-host demos and integration tests.
//!
//! Object-safety via `async-trait`, the same pattern the pack reaches for
//! whenever an async interface needs to be stored as `Arc<dyn Trait>`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::error::PeerError;
use crate::inventory::{Dataset, Snapshot};
use crate::link::{LinkStatus, ReplicationLink};

/// Options passed to `zfs receive` on the remote side (spec §4.3).
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub remotefs: String,
    pub force: bool,
    pub nomount: bool,
}

#[async_trait]
pub trait RemotePeer: Send + Sync {
    async fn list_datasets(&self, root: &str, recursive: bool) -> Result<Vec<Dataset>, PeerError>;
    async fn list_snapshots(&self, root: &str) -> Result<Vec<Snapshot>, PeerError>;
    async fn estimate_send_size(
        &self,
        dataset: &str,
        from: Option<&str>,
        to: &str,
    ) -> Result<u64, PeerError>;

    /// Drives `zfs receive` on the remote side with an already-decoded
    /// (plaintext) stream of send data. Transport plugins (`transport.rs`)
    /// are responsible for decoding before calling this.
    async fn zfs_receive(
        &self,
        options: ReceiveOptions,
        reader: Box<dyn AsyncRead + Unpin + Send>,
    ) -> Result<(), PeerError>;

    /// `snapshots = None` means "all" (what `ClearSnapshots` uses).
    async fn delete_multiple_snapshots(
        &self,
        remotefs: &str,
        snapshots: Option<&[String]>,
    ) -> Result<(), PeerError>;

    async fn destroy_dataset(&self, pool: &str, remotefs: &str) -> Result<(), PeerError>;
    async fn set_readonly(&self, dataset: &str, readonly: bool) -> Result<(), PeerError>;
    async fn mount(&self, dataset: &str) -> Result<(), PeerError>;
    async fn unmount(&self, dataset: &str, recursive: bool) -> Result<(), PeerError>;

    /// Link-registry RPCs (spec §4.4): the peer's copy of a link record,
    /// and pushing our copy onto it.
    async fn get_link(&self, name: &str) -> Result<Option<ReplicationLink>, PeerError>;
    async fn put_link(&self, link: &ReplicationLink) -> Result<(), PeerError>;
    async fn delete_link(&self, name: &str, scrub: bool) -> Result<(), PeerError>;
    async fn put_status(&self, name: &str, status: &LinkStatus) -> Result<(), PeerError>;

    /// Mark every service `related` to `name` on the peer as immutable and
    /// disabled (spec §6 `replication.reserve_services`).
    async fn reserve_services(&self, name: &str) -> Result<(), PeerError>;

    /// Services the peer considers related to a link's datasets, fetched
    /// when the slave side pulls reservations from the master.
    async fn related_services(&self, name: &str) -> Result<Vec<crate::services::ServiceRef>, PeerError>;
}

/// An in-process `RemotePeer`: both "sides" of the link are the same
/// `Arc<Mutex<...>>` state, useful for demos and tests that don't want a
/// real second node. Real deployments supply their own `RemotePeer` wired
/// to the appliance's existing RPC client.
pub struct LoopbackPeer {
    datasets: Mutex<HashMap<String, Dataset>>,
    snapshots: Mutex<HashMap<String, Vec<Snapshot>>>,
    links: Mutex<HashMap<String, ReplicationLink>>,
    statuses: Mutex<HashMap<String, LinkStatus>>,
    estimate: Arc<dyn Fn(&str, Option<&str>, &str) -> u64 + Send + Sync>,
}

impl LoopbackPeer {
    pub fn new() -> Self {
        LoopbackPeer {
            datasets: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            estimate: Arc::new(|_, _, _| 0),
        }
    }

    pub async fn seed_dataset(&self, dataset: Dataset) {
        self.datasets.lock().await.insert(dataset.name.clone(), dataset);
    }

    pub async fn seed_snapshot(&self, snapshot: Snapshot) {
        self.snapshots
            .lock()
            .await
            .entry(snapshot.dataset.clone())
            .or_default()
            .push(snapshot);
    }
}

impl Default for LoopbackPeer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemotePeer for LoopbackPeer {
    async fn list_datasets(&self, root: &str, recursive: bool) -> Result<Vec<Dataset>, PeerError> {
        let datasets = self.datasets.lock().await;
        Ok(datasets
            .values()
            .filter(|d| {
                if recursive {
                    d.name == root || d.name.starts_with(&format!("{root}/"))
                } else {
                    d.name == root
                }
            })
            .cloned()
            .collect())
    }

    async fn list_snapshots(&self, root: &str) -> Result<Vec<Snapshot>, PeerError> {
        let snapshots = self.snapshots.lock().await;
        Ok(snapshots
            .iter()
            .filter(|(dataset, _)| *dataset == root || dataset.starts_with(&format!("{root}/")))
            .flat_map(|(_, snaps)| snaps.iter().cloned())
            .collect())
    }

    async fn estimate_send_size(
        &self,
        dataset: &str,
        from: Option<&str>,
        to: &str,
    ) -> Result<u64, PeerError> {
        Ok((self.estimate)(dataset, from, to))
    }

    async fn zfs_receive(
        &self,
        options: ReceiveOptions,
        mut reader: Box<dyn AsyncRead + Unpin + Send>,
    ) -> Result<(), PeerError> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| PeerError::SubtaskFailed(crate::error::TaskFailure {
                code: libc_eio(),
                message: e.to_string(),
            }))?;
        self.datasets.lock().await.entry(options.remotefs.clone()).or_insert_with(|| Dataset {
            name: options.remotefs.clone(),
            pool: crate::inventory::Dataset::from_name(&options.remotefs),
            mountpoint: None,
            readonly: false,
            encrypted: false,
            guid: "loopback".to_string(),
        });
        Ok(())
    }

    async fn delete_multiple_snapshots(
        &self,
        remotefs: &str,
        snapshots: Option<&[String]>,
    ) -> Result<(), PeerError> {
        let mut all = self.snapshots.lock().await;
        if let Some(list) = all.get_mut(remotefs) {
            match snapshots {
                None => list.clear(),
                Some(names) => list.retain(|s| !names.contains(&s.snapshot_name)),
            }
        }
        Ok(())
    }

    async fn destroy_dataset(&self, _pool: &str, remotefs: &str) -> Result<(), PeerError> {
        self.datasets.lock().await.remove(remotefs);
        self.snapshots.lock().await.remove(remotefs);
        Ok(())
    }

    async fn set_readonly(&self, dataset: &str, readonly: bool) -> Result<(), PeerError> {
        if let Some(d) = self.datasets.lock().await.get_mut(dataset) {
            d.readonly = readonly;
        }
        Ok(())
    }

    async fn mount(&self, _dataset: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn unmount(&self, _dataset: &str, _recursive: bool) -> Result<(), PeerError> {
        Ok(())
    }

    async fn get_link(&self, name: &str) -> Result<Option<ReplicationLink>, PeerError> {
        Ok(self.links.lock().await.get(name).cloned())
    }

    async fn put_link(&self, link: &ReplicationLink) -> Result<(), PeerError> {
        self.links.lock().await.insert(link.name.clone(), link.clone());
        Ok(())
    }

    async fn delete_link(&self, name: &str, _scrub: bool) -> Result<(), PeerError> {
        self.links.lock().await.remove(name);
        Ok(())
    }

    async fn put_status(&self, name: &str, status: &LinkStatus) -> Result<(), PeerError> {
        self.statuses.lock().await.insert(name.to_string(), status.clone());
        Ok(())
    }

    async fn reserve_services(&self, _name: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn related_services(&self, _name: &str) -> Result<Vec<crate::services::ServiceRef>, PeerError> {
        Ok(Vec::new())
    }
}

fn libc_eio() -> i32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_round_trips_a_link() {
        let peer = LoopbackPeer::new();
        let link = ReplicationLink {
            name: "l1".into(),
            partners: ["10.0.0.1".into(), "10.0.0.2".into()],
            master: "10.0.0.1".into(),
            datasets: vec!["tank/a".into()],
            recursive: false,
            bidirectional: false,
            replicate_services: false,
            update_date: "2024-01-01T00:00:00Z".into(),
        };
        peer.put_link(&link).await.unwrap();
        let fetched = peer.get_link("l1").await.unwrap();
        assert_eq!(fetched, Some(link));
    }

    #[tokio::test]
    async fn delete_multiple_snapshots_none_clears_all() {
        let peer = LoopbackPeer::new();
        peer.seed_snapshot(Snapshot {
            dataset: "pool/a".into(),
            snapshot_name: "s1".into(),
            guid: None,
            created_at: 1,
            replicable: true,
            lifetime: 0,
        })
        .await;
        peer.delete_multiple_snapshots("pool/a", None).await.unwrap();
        let snaps = peer.list_snapshots("pool/a").await.unwrap();
        assert!(snaps.is_empty());
    }
}

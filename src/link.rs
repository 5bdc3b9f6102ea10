//! C4 - Link Registry & Reconciler.
//!
//! `ReplicationLink` is the persisted record spec §6 calls `replication.link`;
//! `LinkRegistry` owns its lifecycle (create/update/delete), the two-sided
//! last-writer-wins reconciliation `get_latest_link`/`update_link` perform,
//! and the topology tasks (`check_datasets`, `reserve_services`,
//! `prepare_slave`) ported from `ReplicationBaseTask` and its subtasks in
//! the original dispatcher plugin.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::datastore::Datastore;
use crate::error::{EngineError, ValidationError};
use crate::events::{EventSink, LinkChangedEvent, LinkOperation};
use crate::inventory::Dataset;
use crate::peer::RemotePeer;
use crate::services::ServiceRegistry;

/// A replication relationship between exactly two partner appliances over
/// a shared set of dataset names (spec §3 `replication.link`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationLink {
    pub name: String,
    pub partners: [String; 2],
    pub master: String,
    pub datasets: Vec<String>,
    pub recursive: bool,
    pub bidirectional: bool,
    pub replicate_services: bool,
    /// ISO 8601 / RFC 3339 timestamp, the opaque total order reconciliation
    /// compares on (spec §4.4, §9 Open Question uses `update_date` as
    /// written, no vector clock).
    pub update_date: String,
}

impl ReplicationLink {
    /// Whether this node (identified by `local_ips`) is the master side of
    /// the link.
    pub fn is_master_here(&self, local_ips: &[String]) -> bool {
        local_ips.iter().any(|ip| ip == &self.master)
    }

    /// The partner IP that is not one of ours, if any.
    pub fn remote_ip(&self, local_ips: &[String]) -> Option<&str> {
        self.partners
            .iter()
            .find(|ip| !local_ips.contains(ip))
            .map(String::as_str)
    }
}

/// Outcome of `replication.sync` as the teacher's `reserve_services`
/// style tasks would report it; stored per link with a short TTL so
/// polling clients get a cheap cache hit (spec §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub status: StatusKind,
    pub message: String,
    pub size: u64,
    pub speed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Structural validation a link must pass before it's persisted (spec §7
/// "Validation" row), ported from `ReplicationCreateTask.verify`/`run`.
pub fn validate(
    link: &ReplicationLink,
    local_ips: &[String],
    local_datasets: &[Dataset],
    others: &[ReplicationLink],
) -> Result<(), ValidationError> {
    if link.partners[0] == link.partners[1] {
        return Err(ValidationError::InvalidPartners);
    }
    let local_count = link.partners.iter().filter(|ip| local_ips.contains(ip)).count();
    if local_count != 1 {
        return Err(ValidationError::NotLocallyOwned(local_count));
    }
    if link.datasets.is_empty() {
        return Err(ValidationError::NoDatasets);
    }
    if link.master != link.partners[0] && link.master != link.partners[1] {
        return Err(ValidationError::MasterNotInPartners(link.master.clone()));
    }
    if link.replicate_services && !link.bidirectional {
        return Err(ValidationError::ServicesRequireBidirectional);
    }

    let is_master_here = link.is_master_here(local_ips);
    if is_master_here {
        for name in &link.datasets {
            let dataset = local_datasets
                .iter()
                .find(|d| &d.name == name)
                .ok_or_else(|| ValidationError::DatasetNotFound(name.clone()))?;
            if dataset.encrypted {
                return Err(ValidationError::EncryptedVolume(name.clone()));
            }
        }
    }

    check_conflicts(link, local_ips, others)
}

/// Cross-link dataset conflicts (spec §7 "Conflict" row), ported from
/// `ReplicationBaseTask.check_datasets_valid`: a dataset can't be shared by
/// two bidirectional links, nor appear as master-side in one link and
/// slave-side in another.
pub fn check_conflicts(
    link: &ReplicationLink,
    local_ips: &[String],
    others: &[ReplicationLink],
) -> Result<(), ValidationError> {
    let is_master_here = link.is_master_here(local_ips);
    for other in others {
        if other.name == link.name {
            continue;
        }
        for dataset in &link.datasets {
            if !other.datasets.iter().any(|d| d == dataset) {
                continue;
            }
            if link.bidirectional || other.bidirectional {
                return Err(ValidationError::BidirectionalConflict {
                    dataset: dataset.clone(),
                    other: other.name.clone(),
                });
            }
            let other_is_master_here = other.is_master_here(local_ips);
            if is_master_here != other_is_master_here {
                return Err(ValidationError::OrientationConflict {
                    dataset: dataset.clone(),
                    other: other.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// True if `a` is strictly newer than `b`. Falls back to lexicographic
/// comparison for malformed timestamps so the order stays total (and
/// deterministic) even on bad input.
fn newer(a: &str, b: &str) -> bool {
    match (
        chrono::DateTime::parse_from_rfc3339(a),
        chrono::DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(da), Ok(db)) => da > db,
        _ => a > b,
    }
}

/// "Give me a client for this IP": the connection-pool/auth layer a real
/// deployment already has (spec §1 out of scope).
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn resolve(&self, ip: &str) -> Result<Arc<dyn RemotePeer>, EngineError>;
}

/// Owns the `replication.links` lifecycle: validation, persistence,
/// mirroring to the peer, last-writer-wins reconciliation, and the
/// topology subtasks that key off a link (spec §4.4, §6).
pub struct LinkRegistry {
    datastore: Arc<dyn Datastore>,
    events: Arc<dyn EventSink>,
    peer_resolver: Arc<dyn PeerResolver>,
    local_ips: Vec<String>,

    link_cache: Mutex<HashMap<String, ReplicationLink>>,
    status_cache: Mutex<HashMap<String, (LinkStatus, Instant)>>,
    status_ttl: Duration,

    /// Per-link mutex, so concurrent `update`/`sync`/`delete` calls against
    /// the same link serialize while unrelated links proceed freely.
    link_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Held for the duration of any step that mutates pool topology
    /// (`create`, `prepare_slave`), mirroring the original's single global
    /// "volumes" lock.
    volumes_lock: Mutex<()>,
}

impl LinkRegistry {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        events: Arc<dyn EventSink>,
        peer_resolver: Arc<dyn PeerResolver>,
        local_ips: Vec<String>,
    ) -> Self {
        LinkRegistry {
            datastore,
            events,
            peer_resolver,
            local_ips,
            link_cache: Mutex::new(HashMap::new()),
            status_cache: Mutex::new(HashMap::new()),
            status_ttl: Duration::from_secs(30),
            link_locks: Mutex::new(HashMap::new()),
            volumes_lock: Mutex::new(()),
        }
    }

    async fn lock_for(&self, name: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mut locks = self.link_locks.lock().await;
        let lock = locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        drop(locks);
        lock.lock_owned().await
    }

    async fn cache_link(&self, link: ReplicationLink) {
        self.link_cache.lock().await.insert(link.name.clone(), link);
    }

    async fn mirror_to_peer(&self, link: &ReplicationLink) {
        let Some(remote_ip) = link.remote_ip(&self.local_ips) else {
            return;
        };
        match self.peer_resolver.resolve(remote_ip).await {
            Ok(peer) => {
                if let Err(e) = peer.put_link(link).await {
                    log::warn!(
                        "replication: failed to mirror link {} to peer {remote_ip}: {e}",
                        link.name
                    );
                }
            }
            Err(e) => log::warn!(
                "replication: peer {remote_ip} unreachable while mirroring {}: {e}",
                link.name
            ),
        }
    }

    /// Creates a link: validates against every other known link, persists
    /// it locally, and best-effort mirrors it to the peer.
    pub async fn create(
        &self,
        mut link: ReplicationLink,
        local_datasets: &[Dataset],
    ) -> Result<(), EngineError> {
        let _volumes_guard = self.volumes_lock.lock().await;

        if self.datastore.get(&link.name).await?.is_some() {
            return Err(ValidationError::DuplicateName(link.name.clone()).into());
        }
        let others = self.datastore.list().await?;
        validate(&link, &self.local_ips, local_datasets, &others)?;

        link.update_date = now_iso();
        self.datastore.put(&link).await?;
        self.cache_link(link.clone()).await;
        self.mirror_to_peer(&link).await;

        self.events.emit(LinkChangedEvent {
            operation: LinkOperation::Create,
            ids: vec![link.name.clone()],
        });
        Ok(())
    }

    /// Updates a link. A change to `partners` is a topology change (spec
    /// §9 Open Question 2): it's applied as delete-then-create so the
    /// validation/conflict-check path always runs against the new shape,
    /// rather than mutating a live link out from under `sync`.
    pub async fn update(
        &self,
        mut updated: ReplicationLink,
        local_datasets: &[Dataset],
    ) -> Result<(), EngineError> {
        let _guard = self.lock_for(&updated.name).await;

        let current = self
            .get_latest_link(&updated.name)
            .await?
            .ok_or_else(|| ValidationError::LinkNotFound(updated.name.clone()))?;

        let topology_changed = current.partners != updated.partners;

        let others: Vec<ReplicationLink> = self
            .datastore
            .list()
            .await?
            .into_iter()
            .filter(|l| l.name != current.name)
            .collect();
        validate(&updated, &self.local_ips, local_datasets, &others)?;

        updated.update_date = now_iso();

        if topology_changed {
            drop(_guard);
            self.delete(&current.name, false).await?;
            self.create(updated, local_datasets).await?;
        } else {
            self.datastore.put(&updated).await?;
            self.cache_link(updated.clone()).await;
            self.mirror_to_peer(&updated).await;
            self.events.emit(LinkChangedEvent {
                operation: LinkOperation::Update,
                ids: vec![updated.name.clone()],
            });
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str, scrub: bool) -> Result<(), EngineError> {
        let _guard = self.lock_for(name).await;

        let link = self
            .datastore
            .get(name)
            .await?
            .ok_or_else(|| ValidationError::LinkNotFound(name.to_string()))?;

        self.datastore.delete(name).await?;
        self.link_cache.lock().await.remove(name);
        self.status_cache.lock().await.remove(name);

        if let Some(remote_ip) = link.remote_ip(&self.local_ips) {
            match self.peer_resolver.resolve(remote_ip).await {
                Ok(peer) => {
                    if let Err(e) = peer.delete_link(name, scrub).await {
                        log::warn!("replication: failed to mirror delete of {name} to peer: {e}");
                    }
                }
                Err(e) => log::warn!("replication: peer {remote_ip} unreachable while deleting {name}: {e}"),
            }
        }

        self.events.emit(LinkChangedEvent {
            operation: LinkOperation::Delete,
            ids: vec![name.to_string()],
        });
        Ok(())
    }

    /// Reconciles the local and remote copies of a link by `update_date`
    /// and returns the winner, pushing it to whichever side was stale.
    /// Never fails just because the peer is unreachable: degrades to the
    /// local copy (spec §4.4 "read" semantics).
    pub async fn get_latest_link(&self, name: &str) -> Result<Option<ReplicationLink>, EngineError> {
        let Some(local) = self.datastore.get(name).await? else {
            return Ok(None);
        };

        let Some(remote_ip) = local.remote_ip(&self.local_ips) else {
            self.cache_link(local.clone()).await;
            return Ok(Some(local));
        };

        let peer = match self.peer_resolver.resolve(remote_ip).await {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("replication: peer {remote_ip} unreachable while reconciling {name}: {e}");
                self.cache_link(local.clone()).await;
                return Ok(Some(local));
            }
        };

        let winner = match peer.get_link(name).await {
            Ok(Some(remote)) if newer(&remote.update_date, &local.update_date) => {
                self.datastore.put(&remote).await?;
                remote
            }
            Ok(Some(remote)) if newer(&local.update_date, &remote.update_date) => {
                let _ = peer.put_link(&local).await;
                local
            }
            Ok(Some(_)) => local,
            Ok(None) => {
                let _ = peer.put_link(&local).await;
                local
            }
            Err(e) => {
                log::warn!("replication: failed to fetch peer copy of {name}: {e}");
                local
            }
        };

        self.cache_link(winner.clone()).await;
        Ok(Some(winner))
    }

    /// One-sided ingest of a peer-pushed link (the receiving end of
    /// `RemotePeer::put_link`): stores `incoming` only if it is not older
    /// than what's already here.
    pub async fn update_link(&self, incoming: ReplicationLink) -> Result<(), EngineError> {
        let current = self.datastore.get(&incoming.name).await?;
        let should_store = match &current {
            Some(c) => newer(&incoming.update_date, &c.update_date),
            None => true,
        };
        if should_store {
            self.datastore.put(&incoming).await?;
            self.cache_link(incoming.clone()).await;
            self.events.emit(LinkChangedEvent {
                operation: LinkOperation::Update,
                ids: vec![incoming.name.clone()],
            });
        }
        Ok(())
    }

    pub async fn check_datasets(&self, link: &ReplicationLink) -> Result<(), EngineError> {
        let others: Vec<ReplicationLink> = self
            .datastore
            .list()
            .await?
            .into_iter()
            .filter(|l| l.name != link.name)
            .collect();
        check_conflicts(link, &self.local_ips, &others)?;
        Ok(())
    }

    /// `replication.reserve_services` (spec §6), ported from
    /// `ReplicationReserveServicesTask.run`: the master side delegates to
    /// the peer (who is the slave and does the real reservation); the
    /// slave side pulls the master's related services and mirrors them
    /// in locally, marked immutable and disabled.
    pub async fn reserve_services(
        &self,
        name: &str,
        services: &dyn ServiceRegistry,
    ) -> Result<(), EngineError> {
        let link = self
            .get_latest_link(name)
            .await?
            .ok_or_else(|| ValidationError::LinkNotFound(name.to_string()))?;

        let remote_ip = link
            .remote_ip(&self.local_ips)
            .ok_or_else(|| EngineError::Datastore(format!("link {name} has no remote partner")))?;
        let peer = self.peer_resolver.resolve(remote_ip).await?;

        if link.is_master_here(&self.local_ips) {
            peer.reserve_services(name).await?;
            return Ok(());
        }

        if !link.replicate_services {
            return Err(ValidationError::ServicesRequireBidirectional.into());
        }

        for service in peer.related_services(name).await? {
            services.set_immutable(&service, true).await?;
        }
        Ok(())
    }

    /// `replication.prepare_slave` (spec §6, §9 Open Question 3): ensures
    /// the dataset topology exists on this (slave) node before the first
    /// sync lands. The actual disk-matching heuristic belongs to the
    /// out-of-scope volume supervisor `VolumeProvisioner` stands in for.
    pub async fn prepare_slave(
        &self,
        link: &ReplicationLink,
        provisioner: &dyn crate::services::VolumeProvisioner,
    ) -> Result<(), EngineError> {
        let _guard = self.volumes_lock.lock().await;
        for dataset in &link.datasets {
            provisioner.ensure_topology(dataset).await?;
        }
        Ok(())
    }

    async fn put_status(&self, name: &str, status: LinkStatus, peer: &dyn RemotePeer) {
        self.status_cache
            .lock()
            .await
            .insert(name.to_string(), (status.clone(), Instant::now()));
        if let Err(e) = peer.put_status(name, &status).await {
            log::warn!("replication: failed to push status for {name} to peer: {e}");
        }
    }

    /// Cached status for `name`, or `None` once the TTL has elapsed
    /// (spec §6 `replication.status`).
    pub async fn status(&self, name: &str) -> Option<LinkStatus> {
        let cache = self.status_cache.lock().await;
        cache.get(name).and_then(|(status, at)| {
            if at.elapsed() < self.status_ttl {
                Some(status.clone())
            } else {
                None
            }
        })
    }

    /// Plans and executes a sync for every dataset entry in the link
    /// (spec §4.2/§4.3 run back to back), recording a `LinkStatus` as it
    /// goes. `estimate` sizes are filled in after planning: the planner
    /// itself stays a pure function and never calls `zfs send -n -P`.
    /// `transport_plugins` is the `{name, type, properties}` set spec §6
    /// names; the first entry is selected, defaulting to `Plain` when
    /// none is configured (spec §4.3).
    pub async fn sync(
        &self,
        name: &str,
        follow_delete: bool,
        force: bool,
        nomount: bool,
        transport_plugins: &[crate::transport::TransportPluginConfig],
    ) -> Result<(Vec<crate::planner::ReplicationAction>, u64), EngineError> {
        let link = self
            .get_latest_link(name)
            .await?
            .ok_or_else(|| ValidationError::LinkNotFound(name.to_string()))?;

        let remote_ip = link
            .remote_ip(&self.local_ips)
            .ok_or_else(|| EngineError::Datastore(format!("link {name} has no remote partner")))?;
        let peer = self.peer_resolver.resolve(remote_ip).await?;
        let transport = crate::transport::resolve_plugins(transport_plugins)?;

        self.put_status(
            name,
            LinkStatus {
                status: StatusKind::Running,
                message: "sync in progress".to_string(),
                size: 0,
                speed: 0,
            },
            peer.as_ref(),
        )
        .await;

        let result = self
            .sync_inner(&link, follow_delete, force, nomount, peer.clone(), transport)
            .await;

        let status = match &result {
            Ok((_, size)) => LinkStatus {
                status: StatusKind::Success,
                message: "sync completed".to_string(),
                size: *size,
                speed: 0,
            },
            Err(e) => LinkStatus {
                status: StatusKind::Failed,
                message: e.to_string(),
                size: 0,
                speed: 0,
            },
        };
        self.put_status(name, status, peer.as_ref()).await;

        result
    }

    async fn sync_inner(
        &self,
        link: &ReplicationLink,
        follow_delete: bool,
        force: bool,
        nomount: bool,
        peer: Arc<dyn RemotePeer>,
        transport: Arc<dyn crate::transport::TransportPlugin>,
    ) -> Result<(Vec<crate::planner::ReplicationAction>, u64), EngineError> {
        use crate::inventory::LocalZfs;
        use crate::planner::{plan, ReplicationAction};

        let mut all_actions = Vec::new();
        let mut total_size = 0u64;

        for ds in &link.datasets {
            let local_datasets = LocalZfs::list_datasets(ds, link.recursive).await?;
            let local_snapshots = LocalZfs::list_snapshots(ds).await?;
            let remote_datasets = peer.list_datasets(ds, true).await?;
            let remote_snapshots = peer.list_snapshots(ds).await?;

            let (mut actions, _) = plan(
                ds,
                ds,
                &local_datasets,
                &remote_datasets,
                &local_snapshots,
                &remote_snapshots,
                link.recursive,
                follow_delete,
                &|_, _, _| 0,
            );

            for action in actions.iter_mut() {
                if let ReplicationAction::SendStream {
                    localfs,
                    anchor,
                    snapshot,
                    send_size,
                    ..
                } = action
                {
                    let size =
                        LocalZfs::estimate_send_size(localfs, anchor.as_deref(), snapshot).await?;
                    *send_size = size;
                    total_size += size;
                }
            }

            all_actions.extend(actions);
        }

        let executor = crate::executor::Executor::new(all_actions.clone(), peer, transport, force, nomount);
        executor
            .run(|pct, msg| log::info!("replication {}: {pct}% {msg}", link.name))
            .await?;

        Ok((all_actions, total_size))
    }
}

/// Options for `replicate_dataset` (spec §6): unlike `LinkRegistry::sync`,
/// which assumes snapshots already exist and operates over every dataset
/// in a persisted link, this is the lower-level single-dataset-pair task
/// it takes its own snapshot before planning, ported from
/// `ReplicationPlugin.py`'s `CalculateReplicationDeltaTask`'s sibling
/// `ReplicateDatasetTask.run` path that's invoked ad hoc (outside a link),
/// e.g. from a calendar task or a manual one-off CLI invocation.
#[derive(Debug, Clone)]
pub struct ReplicateOptions {
    pub remoteds: String,
    pub recursive: bool,
    pub follow_delete: bool,
    pub force: bool,
    pub nomount: bool,
    pub snapshot_prefix: String,
    pub replicable: bool,
    pub lifetime_secs: u64,
}

/// `replication.replicate_dataset` (spec §6): snapshot, plan, execute.
/// `dry_run = true` skips snapshot creation and execution, returning only
/// the plan that would run, used by `replication.calculate_delta`-style
/// callers that want an estimate without mutating anything.
/// `transport_plugins` is resolved the same way `LinkRegistry::sync` does.
pub async fn replicate_dataset(
    localds: &str,
    options: &ReplicateOptions,
    peer: Arc<dyn RemotePeer>,
    transport_plugins: &[crate::transport::TransportPluginConfig],
    dry_run: bool,
) -> Result<(Vec<crate::planner::ReplicationAction>, u64), EngineError> {
    use crate::inventory::LocalZfs;
    use crate::naming::{next_available_name, SnapshotProperties};
    use crate::planner::{plan, ReplicationAction};

    if !dry_run {
        let existing = LocalZfs::list_snapshots(localds).await?;
        let at = chrono::Utc::now();
        let name = next_available_name(&options.snapshot_prefix, at, |candidate| {
            existing.iter().any(|s| s.dataset == localds && s.snapshot_name == candidate)
        })
        .ok_or_else(|| EngineError::Datastore(format!("snapshot name suffixes exhausted for {localds}")))?;

        let properties = SnapshotProperties::new(options.replicable, options.lifetime_secs, None);
        LocalZfs::create_snapshot(localds, &name, options.recursive, &properties).await?;
    }

    let local_datasets = LocalZfs::list_datasets(localds, options.recursive).await?;
    let local_snapshots = LocalZfs::list_snapshots(localds).await?;
    let remote_datasets = peer.list_datasets(&options.remoteds, true).await?;
    let remote_snapshots = peer.list_snapshots(&options.remoteds).await?;

    let (mut actions, _) = plan(
        localds,
        &options.remoteds,
        &local_datasets,
        &remote_datasets,
        &local_snapshots,
        &remote_snapshots,
        options.recursive,
        options.follow_delete,
        &|_, _, _| 0,
    );

    let mut total_size = 0u64;
    for action in actions.iter_mut() {
        if let ReplicationAction::SendStream {
            localfs,
            anchor,
            snapshot,
            send_size,
            ..
        } = action
        {
            let size = LocalZfs::estimate_send_size(localfs, anchor.as_deref(), snapshot).await?;
            *send_size = size;
            total_size += size;
        }
    }

    if dry_run {
        return Ok((actions, total_size));
    }

    let transport = crate::transport::resolve_plugins(transport_plugins)?;
    let executor = crate::executor::Executor::new(actions.clone(), peer, transport, options.force, options.nomount);
    executor
        .run(|pct, msg| log::info!("replicate_dataset {localds}: {pct}% {msg}"))
        .await?;

    Ok((actions, total_size))
}

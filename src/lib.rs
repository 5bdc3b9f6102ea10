//! ZFS replication engine: snapshot-inventory diffing, plan execution, and
//! the link-registry state machine that coordinates two appliances.
//!
//! The RPC/WebSocket transport, auth, task-queue framework, config/datastore
//! abstraction, VM/jail supervisor, REST adapters, and CLI this engine is
//! embedded in are out of scope; `peer::RemotePeer`, `datastore::Datastore`,
//! `events::EventSink`, and `services::{ServiceRegistry, VolumeProvisioner}`
//! are the narrow contracts it expects those collaborators to fill.
//! `datastore::ConfigStore` is a sibling contract for node-identity state
//! (the node key slot) that the daemon entry point reads directly rather
//! than routing through the engine.

pub mod config;
pub mod datastore;
pub mod error;
pub mod events;
pub mod executor;
pub mod inventory;
pub mod link;
pub mod naming;
pub mod peer;
pub mod planner;
pub mod role;
pub mod services;
pub mod transport;

use std::sync::Arc;

use crate::datastore::Datastore;
use crate::error::EngineError;
use crate::events::EventSink;
use crate::link::{LinkRegistry, PeerResolver, ReplicationLink};
use crate::services::{ServiceRegistry, VolumeProvisioner};

/// Everything a single node needs wired up to run the replication engine:
/// the link registry (C4) plus the collaborators the role coordinator (C5)
/// needs. Constructed once per daemon and shared across sync invocations.
pub struct Engine {
    pub links: LinkRegistry,
    pub services: Arc<dyn ServiceRegistry>,
    pub volumes: Arc<dyn VolumeProvisioner>,
    local_ips: Vec<String>,
}

impl Engine {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        events: Arc<dyn EventSink>,
        peer_resolver: Arc<dyn PeerResolver>,
        services: Arc<dyn ServiceRegistry>,
        volumes: Arc<dyn VolumeProvisioner>,
        local_ips: Vec<String>,
    ) -> Self {
        Engine {
            links: LinkRegistry::new(datastore, events, peer_resolver, local_ips.clone()),
            services,
            volumes,
            local_ips,
        }
    }

    /// `replication.role_update` (spec §6): reconciles the link, then
    /// applies the role it implies to local dataset mount/readonly state
    /// and dependent services.
    pub async fn role_update(&self, name: &str) -> Result<(), EngineError> {
        let link = self
            .links
            .get_latest_link(name)
            .await?
            .ok_or_else(|| error::ValidationError::LinkNotFound(name.to_string()))?;

        let datasets = crate::inventory::LocalZfs::list_datasets(&first_root(&link), link.recursive).await?;
        crate::role::role_update(&link, &self.local_ips, &datasets, self.services.as_ref()).await
    }
}

fn first_root(link: &ReplicationLink) -> String {
    link.datasets.first().cloned().unwrap_or_default()
}

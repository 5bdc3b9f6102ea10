//! Narrow traits standing in for the share/container/volume supervisors
//! that `spec.md` §1 places out of scope. The role coordinator (`role.rs`)
//! and slave-preparation step (`link.rs`) are the only callers; real
//! deployments wire these to the appliance's existing share/container/
//! volume plugins.

use async_trait::async_trait;

use crate::error::EngineError;

/// A service (share or container) that depends on replicated data and
/// needs to be marked immutable on the slave side (spec §4.5, "reserved
/// service").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub id: String,
    pub dataset: String,
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Services related to any dataset in the link, regardless of current
    /// immutability state.
    async fn related(&self, datasets: &[String]) -> Result<Vec<ServiceRef>, EngineError>;

    /// Mark a service immutable and disabled (demoting to slave) or
    /// mutable (promoting to master).
    async fn set_immutable(&self, service: &ServiceRef, immutable: bool) -> Result<(), EngineError>;
}

/// Stands in for the out-of-scope volume/jail supervisor's disk-topology
/// matching (spec §9 Open Question 3): `prepare_slave` calls this and
/// stops; the `mediasize`-based heuristic itself belongs to that
/// external collaborator.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    async fn ensure_topology(&self, dataset: &str) -> Result<(), EngineError>;
}

/// Always-succeeds stub for tests and single-host demos.
pub struct NoopServices;

#[async_trait]
impl ServiceRegistry for NoopServices {
    async fn related(&self, _datasets: &[String]) -> Result<Vec<ServiceRef>, EngineError> {
        Ok(Vec::new())
    }

    async fn set_immutable(&self, _service: &ServiceRef, _immutable: bool) -> Result<(), EngineError> {
        Ok(())
    }
}

#[async_trait]
impl VolumeProvisioner for NoopServices {
    async fn ensure_topology(&self, _dataset: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

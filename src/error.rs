//! Engine-wide error taxonomy.
//!
//! Pure functions (the planner, snapshot naming) never return these; they
//! are total over their inputs. Everything that touches a subprocess, the
//! datastore, or a peer returns one of these variants instead.

use thiserror::Error;

/// A structured `(code, message)` pair, the shape every subtask/RPC error
/// is normalized to before it crosses a task boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub code: i32,
    pub message: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ZfsError {
    #[error("zfs command failed: {0}")]
    CommandFailed(String),
    #[error("failed to spawn zfs child process: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("could not parse zfs output: {0}")]
    ParseFailed(String),
}

/// Errors surfaced by the `RemotePeer` boundary (spec §4.1, §7).
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer is unreachable: {0}")]
    Unavailable(String),
    #[error("remote subtask failed: {0}")]
    SubtaskFailed(TaskFailure),
}

/// Link precheck / validation failures (spec §7 "Validation" and
/// "Conflict" rows). Surfaced synchronously, never mutate state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("replication link partner IPs do not form a valid pair")]
    InvalidPartners,
    #[error("exactly one partner IP must belong to this host, found {0}")]
    NotLocallyOwned(usize),
    #[error("a replication link named {0:?} already exists")]
    DuplicateName(String),
    #[error("at least one dataset must be specified")]
    NoDatasets,
    #[error("dataset {0:?} does not exist")]
    DatasetNotFound(String),
    #[error("replication master {0:?} must be one of the partners")]
    MasterNotInPartners(String),
    #[error("service replication requires bidirectional replication")]
    ServicesRequireBidirectional,
    #[error("encrypted volumes cannot be included in a replication link: {0:?}")]
    EncryptedVolume(String),
    #[error(
        "bi-directional replication cannot share dataset {dataset:?} with other link {other:?}"
    )]
    BidirectionalConflict { dataset: String, other: String },
    #[error(
        "dataset {dataset:?} conflicts with link {other:?}: cannot be source and target of replication at once"
    )]
    OrientationConflict { dataset: String, other: String },
    #[error("replication link {0:?} does not exist")]
    LinkNotFound(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Zfs(#[from] ZfsError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("subtask failed: {0}")]
    SubtaskFailed(TaskFailure),
    #[error("plan execution failed on action {index}: {message}")]
    PlanExecutionFailed { index: usize, message: String },
    #[error("datastore error: {0}")]
    Datastore(String),
    #[error("aborted")]
    Aborted,
}

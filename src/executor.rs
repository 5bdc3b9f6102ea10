//! C3 - Stream Executor.
//!
//! Drives a planned `Vec<ReplicationAction>` to completion: pairs a local
//! `zfs send` with the peer's `zfs receive` through an anonymous pipe and a
//! pluggable transport, reports progress, and supports cooperative abort.
//! Ported from `ReplicateDatasetTask.run`/`abort` in the original dispatcher
//! plugin; abort uses `tokio_util::sync::CancellationToken`, the same
//! primitive the teacher's `main.rs` uses for its own shutdown signal.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::peer::{ReceiveOptions, RemotePeer};
use crate::planner::ReplicationAction;
use crate::transport::TransportPlugin;

/// Executes one `ReplicationPlan`. Holds no state beyond the plan itself
/// and the cancellation token a caller can trip to abort mid-run.
pub struct Executor {
    actions: Vec<ReplicationAction>,
    peer: Arc<dyn RemotePeer>,
    transport: Arc<dyn TransportPlugin>,
    force: bool,
    nomount: bool,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        actions: Vec<ReplicationAction>,
        peer: Arc<dyn RemotePeer>,
        transport: Arc<dyn TransportPlugin>,
        force: bool,
        nomount: bool,
    ) -> Self {
        Executor {
            actions,
            peer,
            transport,
            force,
            nomount,
            cancel: CancellationToken::new(),
        }
    }

    /// A token a concurrent caller can cancel to request an abort; checked
    /// between actions and, for `SendStream`, while the pipe is open.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Runs every action in order, reporting progress before each one
    /// starts. The first failure aborts the whole plan (spec §4.3
    /// "Failure semantics"); a prior abort request does the same.
    pub async fn run(&self, progress: impl Fn(u8, &str)) -> Result<(), EngineError> {
        let n = self.actions.len();
        for (i, action) in self.actions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            let pct = if n == 0 { 100 } else { (100 * i / n) as u8 };
            progress(pct, &action.describe());

            self.run_action(action).await?;
        }
        Ok(())
    }

    async fn run_action(&self, action: &ReplicationAction) -> Result<(), EngineError> {
        match action {
            ReplicationAction::SendStream {
                localfs,
                remotefs,
                anchor,
                snapshot,
                send_size,
                ..
            } => {
                self.run_send_stream(localfs, remotefs, anchor.as_deref(), snapshot, *send_size)
                    .await
            }
            ReplicationAction::DeleteSnapshots {
                remotefs, snapshots, ..
            } => self
                .peer
                .delete_multiple_snapshots(remotefs, Some(snapshots.as_slice()))
                .await
                .map_err(EngineError::from),
            ReplicationAction::ClearSnapshots { remotefs, .. } => self
                .peer
                .delete_multiple_snapshots(remotefs, None)
                .await
                .map_err(EngineError::from),
            ReplicationAction::DeleteDataset { remotefs, .. } => {
                let pool = crate::inventory::Dataset::from_name(remotefs);
                self.peer
                    .destroy_dataset(&pool, remotefs)
                    .await
                    .map_err(EngineError::from)
            }
        }
    }

    /// Pipes a local `zfs send` into the transport plugin into the peer's
    /// `zfs receive`. Both the local send subtask and the remote receive
    /// must finish successfully for the action to succeed; a cancelled
    /// token kills the `zfs send` child and shuts down the write half of
    /// the pipe, turning both ends into a broken-pipe failure (spec §4.3
    /// "Abort").
    async fn run_send_stream(
        &self,
        localfs: &str,
        remotefs: &str,
        anchor: Option<&str>,
        snapshot: &str,
        send_size: u64,
    ) -> Result<(), EngineError> {
        let mut child = crate::inventory::LocalZfs::send(localfs, anchor, snapshot).await?;
        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Datastore("zfs send produced no stdout pipe".into()))?;

        let (mut pipe_writer, pipe_reader) = tokio::io::duplex(64 * 1024);

        let cancel = self.cancel.clone();
        let forward_task = tokio::spawn(async move {
            tokio::select! {
                result = tokio::io::copy(&mut child_stdout, &mut pipe_writer) => {
                    let _ = pipe_writer.shutdown().await;
                    result.map(|_| ())
                }
                _ = cancel.cancelled() => {
                    let _ = pipe_writer.shutdown().await;
                    Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sync aborted"))
                }
            }
        });

        let options = ReceiveOptions {
            remotefs: remotefs.to_string(),
            force: self.force,
            nomount: self.nomount,
        };
        let transport = self.transport.clone();
        let peer = self.peer.clone();
        let receive_cancel = self.cancel.clone();
        let receive_task = tokio::spawn(async move {
            tokio::select! {
                result = transport.send(Box::new(pipe_reader), peer.as_ref(), options) => result,
                _ = receive_cancel.cancelled() => Err(EngineError::Aborted),
            }
        });

        let wait_cancel = self.cancel.clone();
        let send_status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| EngineError::Datastore(format!("zfs send wait failed: {e}")))?,
            _ = wait_cancel.cancelled() => {
                let _ = child.kill().await;
                child.wait().await.map_err(|e| EngineError::Datastore(format!("zfs send wait failed: {e}")))?
            }
        };

        let forward_result = forward_task
            .await
            .map_err(|e| EngineError::Datastore(format!("send-pipe task panicked: {e}")))?;
        let receive_result = receive_task
            .await
            .map_err(|e| EngineError::Datastore(format!("receive task panicked: {e}")))?;

        if self.cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }
        if !send_status.success() {
            return Err(EngineError::PlanExecutionFailed {
                index: 0,
                message: format!("zfs send {localfs}@{snapshot} exited with {send_status}"),
            });
        }
        if let Err(e) = forward_result {
            return Err(EngineError::PlanExecutionFailed {
                index: 0,
                message: format!("send pipe broke: {e}"),
            });
        }
        receive_result?;

        log::debug!(
            "replication: sent {localfs}@{snapshot} to {remotefs} ({send_size} bytes estimated)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LoopbackPeer;
    use crate::transport::PlainTransport;

    #[tokio::test]
    async fn empty_plan_completes_immediately() {
        let peer = Arc::new(LoopbackPeer::new());
        let executor = Executor::new(Vec::new(), peer, Arc::new(PlainTransport), false, false);
        executor.run(|_, _| {}).await.unwrap();
    }

    #[tokio::test]
    async fn delete_snapshots_action_calls_peer() {
        let peer = Arc::new(LoopbackPeer::new());
        peer.seed_snapshot(crate::inventory::Snapshot {
            dataset: "pool/a".into(),
            snapshot_name: "s1".into(),
            guid: None,
            created_at: 1,
            replicable: true,
            lifetime: 0,
        })
        .await;

        let actions = vec![ReplicationAction::DeleteSnapshots {
            localfs: "tank/a".into(),
            remotefs: "pool/a".into(),
            snapshots: vec!["s1".into()],
        }];
        let executor = Executor::new(actions, peer.clone(), Arc::new(PlainTransport), false, false);
        executor.run(|_, _| {}).await.unwrap();

        assert!(peer.list_snapshots("pool/a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn already_aborted_executor_fails_before_first_action() {
        let peer = Arc::new(LoopbackPeer::new());
        let actions = vec![ReplicationAction::ClearSnapshots {
            localfs: "tank/a".into(),
            remotefs: "pool/a".into(),
        }];
        let executor = Executor::new(actions, peer, Arc::new(PlainTransport), false, false);
        executor.abort();

        let err = executor.run(|_, _| {}).await.unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
    }

    #[tokio::test]
    async fn delete_dataset_action_removes_remote_dataset() {
        let peer = Arc::new(LoopbackPeer::new());
        peer.seed_dataset(crate::inventory::Dataset {
            name: "pool/b".into(),
            pool: "pool".into(),
            mountpoint: None,
            readonly: false,
            encrypted: false,
            guid: "g".into(),
        })
        .await;

        let actions = vec![ReplicationAction::DeleteDataset {
            localfs: "tank/b".into(),
            remotefs: "pool/b".into(),
        }];
        let executor = Executor::new(actions, peer.clone(), Arc::new(PlainTransport), false, false);
        executor.run(|_, _| {}).await.unwrap();

        assert!(peer.list_datasets("pool/b", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_reports_floor_percentage_before_each_action() {
        let peer = Arc::new(LoopbackPeer::new());
        let actions = vec![
            ReplicationAction::ClearSnapshots {
                localfs: "tank/a".into(),
                remotefs: "pool/a".into(),
            },
            ReplicationAction::ClearSnapshots {
                localfs: "tank/b".into(),
                remotefs: "pool/b".into(),
            },
        ];
        let executor = Executor::new(actions, peer, Arc::new(PlainTransport), false, false);

        let seen = std::sync::Mutex::new(Vec::new());
        executor
            .run(|pct, _| seen.lock().unwrap().push(pct))
            .await
            .unwrap();
        assert_eq!(seen.into_inner().unwrap(), vec![0, 50]);
    }
}

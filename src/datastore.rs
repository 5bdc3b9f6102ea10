//! The `replication.links` persisted collection and the
//! `replication.key.private`/`.public` config-store slot (spec §6),
//! behind narrow traits. The real database engine and config-store
//! abstraction are out of scope (spec §1); this is a JSON-file-backed
//! stand-in, in the teacher's `toml`-via-`serde` spirit but reading more
//! naturally as JSON for a keyed record collection.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::link::ReplicationLink;

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ReplicationLink>, EngineError>;
    async fn list(&self) -> Result<Vec<ReplicationLink>, EngineError>;
    async fn put(&self, link: &ReplicationLink) -> Result<(), EngineError>;
    async fn delete(&self, name: &str) -> Result<(), EngineError>;
}

/// The opaque node key slot (spec §6, §9 Open Question 4): a real RSA
/// 2048 keypair and the SSH-auth wire format it serves belong to the
/// out-of-scope auth layer, so this crate generates and stores a 256-bit
/// random key instead, lazily on first use.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_node_key(&self) -> Result<Option<Vec<u8>>, EngineError>;
    async fn set_node_key(&self, key: Vec<u8>) -> Result<(), EngineError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    #[serde(default)]
    links: HashMap<String, ReplicationLink>,
    #[serde(default)]
    node_key: Option<String>,
}

/// File-backed implementation: the whole collection round-trips as one
/// JSON document, read-modify-written under a single in-process lock.
/// Good enough for a single-daemon-per-node deployment; a real
/// multi-writer datastore is the out-of-scope collaborator this stands
/// in for.
pub struct FileDatastore {
    path: PathBuf,
    state: Mutex<Persisted>,
}

impl FileDatastore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| EngineError::Datastore(format!("corrupt datastore file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Persisted::default(),
            Err(e) => return Err(EngineError::Datastore(e.to_string())),
        };
        Ok(FileDatastore {
            path,
            state: Mutex::new(state),
        })
    }

    async fn flush(&self, state: &Persisted) -> Result<(), EngineError> {
        let serialized = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::Datastore(format!("failed to serialize datastore: {e}")))?;
        tokio::fs::write(&self.path, serialized)
            .await
            .map_err(|e| EngineError::Datastore(e.to_string()))
    }
}

#[async_trait]
impl Datastore for FileDatastore {
    async fn get(&self, name: &str) -> Result<Option<ReplicationLink>, EngineError> {
        Ok(self.state.lock().await.links.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ReplicationLink>, EngineError> {
        Ok(self.state.lock().await.links.values().cloned().collect())
    }

    async fn put(&self, link: &ReplicationLink) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.links.insert(link.name.clone(), link.clone());
        self.flush(&state).await
    }

    async fn delete(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.links.remove(name);
        self.flush(&state).await
    }
}

#[async_trait]
impl ConfigStore for FileDatastore {
    async fn get_node_key(&self) -> Result<Option<Vec<u8>>, EngineError> {
        let state = self.state.lock().await;
        state
            .node_key
            .as_ref()
            .map(|hex| decode_hex(hex))
            .transpose()
    }

    async fn set_node_key(&self, key: Vec<u8>) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.node_key = Some(encode_hex(&key));
        self.flush(&state).await
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, EngineError> {
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| EngineError::Datastore(format!("corrupt node key: {e}")))
        })
        .collect()
}

/// In-memory double for tests.
#[derive(Default)]
pub struct InMemoryDatastore {
    links: Mutex<HashMap<String, ReplicationLink>>,
    node_key: Mutex<Option<Vec<u8>>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        InMemoryDatastore::default()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn get(&self, name: &str) -> Result<Option<ReplicationLink>, EngineError> {
        Ok(self.links.lock().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ReplicationLink>, EngineError> {
        Ok(self.links.lock().await.values().cloned().collect())
    }

    async fn put(&self, link: &ReplicationLink) -> Result<(), EngineError> {
        self.links.lock().await.insert(link.name.clone(), link.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), EngineError> {
        self.links.lock().await.remove(name);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for InMemoryDatastore {
    async fn get_node_key(&self) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.node_key.lock().await.clone())
    }

    async fn set_node_key(&self, key: Vec<u8>) -> Result<(), EngineError> {
        *self.node_key.lock().await = Some(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(name: &str, update_date: &str) -> ReplicationLink {
        ReplicationLink {
            name: name.to_string(),
            partners: ["10.0.0.1".into(), "10.0.0.2".into()],
            master: "10.0.0.1".into(),
            datasets: vec!["tank/a".into()],
            recursive: false,
            bidirectional: false,
            replicate_services: false,
            update_date: update_date.to_string(),
        }
    }

    #[tokio::test]
    async fn file_datastore_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("zreplicate-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("replication.json");

        {
            let store = FileDatastore::open(&path).await.unwrap();
            store.put(&link("l1", "2024-01-01T00:00:00Z")).await.unwrap();
            store.set_node_key(vec![1, 2, 3, 4]).await.unwrap();
        }

        let reopened = FileDatastore::open(&path).await.unwrap();
        assert_eq!(reopened.get("l1").await.unwrap(), Some(link("l1", "2024-01-01T00:00:00Z")));
        assert_eq!(reopened.get_node_key().await.unwrap(), Some(vec![1, 2, 3, 4]));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let path = std::env::temp_dir().join(format!("zreplicate-test-missing-{}", uuid::Uuid::new_v4()));
        let store = FileDatastore::open(&path).await.unwrap();
        assert_eq!(store.list().await.unwrap(), Vec::new());
    }
}

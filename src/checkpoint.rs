//! Persisted replay ids, so a restarted subscriber resumes where it left
//! off.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::debug;

use crate::types::{ConvertError, ReplayId, TopicName};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored replay id for {topic} is invalid: {source}")]
    InvalidReplayId {
        topic: String,
        source: ConvertError,
    },
}

/// Storage for the last processed replay id of each topic.
pub trait CheckpointStore: Send + Sync {
    fn load(
        &self,
        topic: &TopicName,
    ) -> impl Future<Output = Result<Option<ReplayId>, CheckpointError>> + Send;

    fn save(
        &self,
        topic: &TopicName,
        replay_id: &ReplayId,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    replay_ids: Mutex<HashMap<TopicName, ReplayId>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(
        &self,
        topic: &TopicName,
    ) -> impl Future<Output = Result<Option<ReplayId>, CheckpointError>> + Send {
        let replay_id = self
            .replay_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned();
        std::future::ready(Ok(replay_id))
    }

    fn save(
        &self,
        topic: &TopicName,
        replay_id: &ReplayId,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send {
        self.replay_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.clone(), replay_id.clone());
        std::future::ready(Ok(()))
    }
}

/// Checkpoints kept in a JSON file mapping topic names to hex replay ids.
///
/// Every save rewrites the file through a temporary sibling and a rename,
/// so a crash never leaves a partially written file behind.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, String>, CheckpointError> {
        match tokio::fs::read(&self.path).await {
            Ok(contents) if contents.is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, topic: &TopicName) -> Result<Option<ReplayId>, CheckpointError> {
        let checkpoints = self.read().await?;
        checkpoints
            .get(topic.as_str())
            .map(|hex| {
                hex.parse().map_err(|source| CheckpointError::InvalidReplayId {
                    topic: topic.to_string(),
                    source,
                })
            })
            .transpose()
    }

    async fn save(&self, topic: &TopicName, replay_id: &ReplayId) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;

        let mut checkpoints = self.read().await?;
        checkpoints.insert(topic.to_string(), replay_id.to_string());

        let temp = self.temp_path();
        tokio::fs::write(&temp, serde_json::to_vec_pretty(&checkpoints)?).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(%topic, %replay_id, path = %self.path.display(), "saved checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> TopicName {
        name.parse().unwrap()
    }

    fn replay_id(hex: &str) -> ReplayId {
        hex.parse().unwrap()
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryCheckpointStore::new();
        let account = topic("/data/AccountChangeEvent");

        assert_eq!(store.load(&account).await.unwrap(), None);
        store.save(&account, &replay_id("0a0b")).await.unwrap();
        store.save(&account, &replay_id("0a0c")).await.unwrap();
        assert_eq!(store.load(&account).await.unwrap(), Some(replay_id("0a0c")));
    }

    #[tokio::test]
    async fn file_store_keeps_topics_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let store = FileCheckpointStore::new(&path);
        let account = topic("/data/AccountChangeEvent");
        let employee = topic("/data/Employee__ChangeEvent");

        assert_eq!(store.load(&account).await.unwrap(), None);

        store.save(&account, &replay_id("0001")).await.unwrap();
        store.save(&employee, &replay_id("00ff")).await.unwrap();
        store.save(&account, &replay_id("0002")).await.unwrap();

        let reopened = FileCheckpointStore::new(&path);
        assert_eq!(reopened.load(&account).await.unwrap(), Some(replay_id("0002")));
        assert_eq!(reopened.load(&employee).await.unwrap(), Some(replay_id("00ff")));

        let contents: BTreeMap<String, String> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(contents["/data/AccountChangeEvent"], "0002");
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn corrupt_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let account = topic("/data/AccountChangeEvent");

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileCheckpointStore::new(&path).load(&account).await,
            Err(CheckpointError::Json(_))
        ));

        std::fs::write(&path, r#"{"/data/AccountChangeEvent": "zz"}"#).unwrap();
        assert!(matches!(
            FileCheckpointStore::new(&path).load(&account).await,
            Err(CheckpointError::InvalidReplayId { .. })
        ));
    }
}

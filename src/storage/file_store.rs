// File-backed `PersistentStore`. Partitions storage per node-id under a
// data directory so multiple nodes may share one `RAFT_DATA_DIR` without
// collision:
//
//   <dataDir>/<nodeId>/term.json
//   <dataDir>/<nodeId>/vote.json
//   <dataDir>/<nodeId>/log/<index>.json
//
// Every file is an `Envelope { data, checksum, timestamp }` written via
// write-to-temp + atomic rename; `load_state` recomputes and verifies the
// checksum, treating a mismatch as a hard load failure.

use super::{Envelope, PersistentState, PersistentStore};
use crate::error::{ClusterError, Result};
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct FileStore {
    node_dir: PathBuf,
}

impl FileStore {
    pub async fn open(data_dir: impl AsRef<Path>, node_id: &NodeId) -> Result<Self> {
        let node_dir = data_dir.as_ref().join(node_id.as_str());
        fs::create_dir_all(&node_dir).await?;
        fs::create_dir_all(node_dir.join("log")).await?;
        Ok(Self { node_dir })
    }

    fn term_path(&self) -> PathBuf {
        self.node_dir.join("term.json")
    }

    fn vote_path(&self) -> PathBuf {
        self.node_dir.join("vote.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.node_dir.join("snapshot.json")
    }

    fn log_dir(&self) -> PathBuf {
        self.node_dir.join("log")
    }

    fn entry_path(&self, index: LogIndex) -> PathBuf {
        self.log_dir().join(format!("{:020}.json", index))
    }

    async fn write_envelope<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        let envelope = Envelope::wrap(data);
        let bytes = serde_json::to_vec(&envelope)?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_envelope<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let envelope: Envelope = serde_json::from_slice(&bytes)?;
                let data = envelope.verify()?;
                Ok(Some(serde_json::from_slice(data)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClusterError::Io(e)),
        }
    }

    async fn load_log(&self) -> Result<Vec<LogEntry>> {
        let mut indices = Vec::new();
        let mut dir = fs::read_dir(self.log_dir()).await?;
        while let Some(ent) = dir.next_entry().await? {
            let name = ent.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(index) = stem.parse::<LogIndex>() {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();

        let mut log = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(entry) = Self::read_envelope::<LogEntry>(&self.entry_path(index)).await? {
                log.push(entry);
            }
        }
        Ok(log)
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn load_state(&self) -> Result<PersistentState> {
        let current_term = Self::read_envelope::<Term>(&self.term_path())
            .await?
            .unwrap_or(0);
        let voted_for = Self::read_envelope::<Option<NodeId>>(&self.vote_path())
            .await?
            .unwrap_or(None);
        let log = self.load_log().await?;
        Ok(PersistentState {
            current_term,
            voted_for,
            log,
        })
    }

    async fn save_term(&self, term: Term) -> Result<()> {
        let current = self.load_state().await?.current_term;
        if term < current {
            return Err(ClusterError::InvalidArgument(format!(
                "save_term: {} < currentTerm {}",
                term, current
            )));
        }
        Self::write_envelope(&self.term_path(), &term).await?;
        self.save_voted_for(None).await
    }

    async fn save_voted_for(&self, voted_for: Option<NodeId>) -> Result<()> {
        Self::write_envelope(&self.vote_path(), &voted_for).await
    }

    async fn save_log_entry(&self, entry: LogEntry) -> Result<()> {
        if entry.index == 0 {
            return Err(ClusterError::InvalidArgument(
                "save_log_entry: index must be >= 1".into(),
            ));
        }
        let last = self.load_log().await?.last().map(|e| e.index).unwrap_or(0);
        if entry.index > last + 1 {
            return Err(ClusterError::InvalidArgument(format!(
                "save_log_entry: non-consecutive index {} (log length {})",
                entry.index, last
            )));
        }
        let path = self.entry_path(entry.index);
        Self::write_envelope(&path, &entry).await
    }

    async fn truncate_log_from(&self, index: LogIndex) -> Result<()> {
        if index == 0 {
            return Err(ClusterError::InvalidArgument(
                "truncate_log_from: index must be >= 1".into(),
            ));
        }
        let mut dir = fs::read_dir(self.log_dir()).await?;
        let mut to_remove = Vec::new();
        while let Some(ent) = dir.next_entry().await? {
            let name = ent.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(entry_index) = stem.parse::<LogIndex>() {
                    if entry_index >= index {
                        to_remove.push(ent.path());
                    }
                }
            }
        }
        for path in to_remove {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn save_snapshot(&self, blob: &[u8]) -> Result<()> {
        Self::write_envelope(&self.snapshot_path(), &blob.to_vec()).await
    }

    async fn load_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Self::read_envelope::<Vec<u8>>(&self.snapshot_path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Command;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::new(index, term, Command::DeleteProject { id: "x".into() }, 0)
    }

    #[tokio::test]
    async fn persists_across_fresh_handle() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeId::new("node-1");
        {
            let store = FileStore::open(dir.path(), &node).await.unwrap();
            store.save_term(7).await.unwrap();
            store.save_voted_for(Some(NodeId::new("node-2"))).await.unwrap();
            store.save_log_entry(entry(1, 1)).await.unwrap();
            store.save_log_entry(entry(2, 1)).await.unwrap();
            store.save_log_entry(entry(3, 2)).await.unwrap();
        }

        let reopened = FileStore::open(dir.path(), &node).await.unwrap();
        let state = reopened.load_state().await.unwrap();
        assert_eq!(state.current_term, 7);
        assert_eq!(state.voted_for, Some(NodeId::new("node-2")));
        assert_eq!(state.log.len(), 3);
        assert_eq!(state.log[2].term, 2);
    }

    #[tokio::test]
    async fn multiple_nodes_share_data_dir_without_collision() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileStore::open(dir.path(), &NodeId::new("a")).await.unwrap();
        let b = FileStore::open(dir.path(), &NodeId::new("b")).await.unwrap();
        a.save_term(1).await.unwrap();
        b.save_term(9).await.unwrap();
        assert_eq!(a.load_state().await.unwrap().current_term, 1);
        assert_eq!(b.load_state().await.unwrap().current_term, 9);
    }

    #[tokio::test]
    async fn truncate_from_beyond_log_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), &NodeId::new("n")).await.unwrap();
        store.save_log_entry(entry(1, 1)).await.unwrap();
        store.truncate_log_from(5).await.unwrap();
        assert_eq!(store.load_state().await.unwrap().log.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_absent_until_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), &NodeId::new("n")).await.unwrap();
        assert!(store.load_snapshot().await.unwrap().is_none());
        store.save_snapshot(b"blob-v1").await.unwrap();
        assert_eq!(store.load_snapshot().await.unwrap().unwrap(), b"blob-v1");
        store.save_snapshot(b"blob-v2").await.unwrap();
        assert_eq!(store.load_snapshot().await.unwrap().unwrap(), b"blob-v2");
    }
}

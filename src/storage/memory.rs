// In-memory `PersistentStore`. Satisfies the same contract as `FileStore`
// minus durability; permitted only for tests.

use super::{PersistentState, PersistentStore};
use crate::error::{ClusterError, Result};
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<PersistentState>,
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn load_state(&self) -> Result<PersistentState> {
        Ok(self.state.lock().clone())
    }

    async fn save_term(&self, term: Term) -> Result<()> {
        let mut state = self.state.lock();
        if term < state.current_term {
            return Err(ClusterError::InvalidArgument(format!(
                "save_term: {} < currentTerm {}",
                term, state.current_term
            )));
        }
        state.current_term = term;
        state.voted_for = None;
        Ok(())
    }

    async fn save_voted_for(&self, voted_for: Option<NodeId>) -> Result<()> {
        self.state.lock().voted_for = voted_for;
        Ok(())
    }

    async fn save_log_entry(&self, entry: LogEntry) -> Result<()> {
        let mut state = self.state.lock();
        if entry.index == 0 {
            return Err(ClusterError::InvalidArgument(
                "save_log_entry: index must be >= 1".into(),
            ));
        }
        let len = state.log.len() as LogIndex;
        if entry.index <= len {
            state.log[(entry.index - 1) as usize] = entry;
        } else if entry.index == len + 1 {
            state.log.push(entry);
        } else {
            return Err(ClusterError::InvalidArgument(format!(
                "save_log_entry: non-consecutive index {} (log length {})",
                entry.index, len
            )));
        }
        Ok(())
    }

    async fn truncate_log_from(&self, index: LogIndex) -> Result<()> {
        if index == 0 {
            return Err(ClusterError::InvalidArgument(
                "truncate_log_from: index must be >= 1".into(),
            ));
        }
        let mut state = self.state.lock();
        let len = state.log.len() as LogIndex;
        if index > len {
            return Ok(());
        }
        state.log.truncate((index - 1) as usize);
        Ok(())
    }

    async fn save_snapshot(&self, blob: &[u8]) -> Result<()> {
        *self.snapshot.lock() = Some(blob.to_vec());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.lock().clone())
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
    async fn append_then_load_round_trips() {
        let store = MemoryStore::new();
        store.save_term(3).await.unwrap();
        store.save_voted_for(Some(NodeId::new("n2"))).await.unwrap();
        store.save_log_entry(entry(1, 1)).await.unwrap();
        store.save_log_entry(entry(2, 2)).await.unwrap();

        let state = store.load_state().await.unwrap();
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for, Some(NodeId::new("n2")));
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.last_log_index(), 2);
    }

    #[tokio::test]
    async fn save_term_resets_voted_for() {
        let store = MemoryStore::new();
        store.save_voted_for(Some(NodeId::new("n2"))).await.unwrap();
        store.save_term(1).await.unwrap();
        assert_eq!(store.load_state().await.unwrap().voted_for, None);
    }

    #[tokio::test]
    async fn save_term_rejects_regression() {
        let store = MemoryStore::new();
        store.save_term(5).await.unwrap();
        assert!(store.save_term(4).await.is_err());
    }

    #[tokio::test]
    async fn non_consecutive_append_rejected() {
        let store = MemoryStore::new();
        assert!(store.save_log_entry(entry(2, 1)).await.is_err());
        assert!(store.save_log_entry(entry(0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn truncate_from_beyond_log_is_noop() {
        let store = MemoryStore::new();
        store.save_log_entry(entry(1, 1)).await.unwrap();
        store.truncate_log_from(5).await.unwrap();
        assert_eq!(store.load_state().await.unwrap().log.len(), 1);
    }

    #[tokio::test]
    async fn truncate_removes_tail_inclusive() {
        let store = MemoryStore::new();
        store.save_log_entry(entry(1, 1)).await.unwrap();
        store.save_log_entry(entry(2, 1)).await.unwrap();
        store.save_log_entry(entry(3, 1)).await.unwrap();
        store.truncate_log_from(2).await.unwrap();
        let state = store.load_state().await.unwrap();
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.last_log_index(), 1);
    }

    #[tokio::test]
    async fn replace_in_place_for_existing_index() {
        let store = MemoryStore::new();
        store.save_log_entry(entry(1, 1)).await.unwrap();
        store.save_log_entry(entry(1, 2)).await.unwrap();
        let state = store.load_state().await.unwrap();
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log[0].term, 2);
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let store = MemoryStore::new();
        assert!(store.load_snapshot().await.unwrap().is_none());
        store.save_snapshot(b"blob").await.unwrap();
        assert_eq!(store.load_snapshot().await.unwrap().unwrap(), b"blob");
    }
}

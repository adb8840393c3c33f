// Persistent Store — the crash-consistent home for `currentTerm`,
// `votedFor`, and the replicated log.
//
// Every mutation is durable-before-return: callers must not act on a state
// transition that needs to survive a crash until the relevant call here
// has completed successfully. `FileStore` gets that property from
// write-to-temp + atomic rename, checked on read by a content hash;
// `MemoryStore` gives up durability entirely and exists only for tests.

pub mod checksum;
pub mod file_store;
pub mod memory;

pub use file_store::FileStore;
pub use memory::MemoryStore;

use crate::error::{ClusterError, Result};
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Full persistent Raft state as returned by `load_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

impl PersistentState {
    pub fn last_log_index(&self) -> LogIndex {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// `index` is 1-based; `log[i].index == i` is the store's invariant.
    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }
}

/// On-disk / in-memory envelope wrapping a serialized record with an
/// integrity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub checksum: u32,
    pub timestamp: i64,
}

impl Envelope {
    pub fn wrap(data: Vec<u8>) -> Self {
        let checksum = checksum::checksum(&data);
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self {
            data,
            checksum,
            timestamp,
        }
    }

    pub fn verify(&self) -> Result<&[u8]> {
        if checksum::checksum(&self.data) != self.checksum {
            return Err(ClusterError::Storage(
                "checksum mismatch on persisted record".into(),
            ));
        }
        Ok(&self.data)
    }
}

/// Durable home for Raft's persistent state.
///
/// `save_log_entry` both appends (`index == length(log) + 1`) and replaces
/// in place (`index <= length(log)`); `truncate_log_from` removes every
/// entry with `index >= i`, retaining everything before it verbatim.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load_state(&self) -> Result<PersistentState>;

    /// Rejects `term < currentTerm`. Resets `votedFor` to `None` as a side
    /// effect, per the invariant that a vote never outlives the term it was
    /// cast in.
    async fn save_term(&self, term: Term) -> Result<()>;

    async fn save_voted_for(&self, voted_for: Option<NodeId>) -> Result<()>;

    /// Rejects `entry.index == 0` and non-consecutive appends
    /// (`entry.index > length(log) + 1`).
    async fn save_log_entry(&self, entry: LogEntry) -> Result<()>;

    /// Rejects `index == 0`. `index > length(log)` is a no-op.
    async fn truncate_log_from(&self, index: LogIndex) -> Result<()>;

    /// Persists an opaque, already-encoded state-machine snapshot blob
    /// (see `state_machine::snapshot::encode`). Overwrites any prior
    /// snapshot.
    async fn save_snapshot(&self, blob: &[u8]) -> Result<()>;

    /// Returns the most recently saved snapshot blob, or `None` if this
    /// node has never saved one.
    async fn load_snapshot(&self) -> Result<Option<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let env = Envelope::wrap(b"hello".to_vec());
        assert_eq!(env.verify().unwrap(), b"hello");
    }

    #[test]
    fn envelope_detects_corruption() {
        let mut env = Envelope::wrap(b"hello".to_vec());
        env.data[0] ^= 0xFF;
        assert!(env.verify().is_err());
    }

    #[test]
    fn persistent_state_entry_lookup() {
        let mut state = PersistentState::default();
        state
            .log
            .push(LogEntry::new(1, 1, crate::types::Command::DeleteProject { id: "x".into() }, 0));
        assert_eq!(state.entry_at(1).unwrap().index, 1);
        assert!(state.entry_at(0).is_none());
        assert!(state.entry_at(2).is_none());
    }
}

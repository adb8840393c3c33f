// Shared identifiers and wire-level types used across the consensus engine.
//
// These are the nouns every other module speaks in: node identity, the
// raft term/index pair, and the tagged `Command` union that the state
// machine interprets. Kept together so storage, transport, raft and the
// state machine don't each invent their own copies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a cluster node (matches `RAFT_NODE_ID`/`RAFT_NODES`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Raft term — a monotonically increasing leadership epoch.
pub type Term = u64;

/// 1-indexed, gap-free log index.
pub type LogIndex = u64;

/// A durably stored command with a unique `(index, term)` identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Command,
    /// Unix-epoch milliseconds set once by the proposing leader. `apply`
    /// must treat this as the only source of "now"; it never reads the
    /// wall clock itself.
    pub timestamp: i64,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Command, timestamp: i64) -> Self {
        Self {
            index,
            term,
            command,
            timestamp,
        }
    }
}

/// Per-file payload for a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// `None` means the file is deleted.
    pub content: Option<String>,
}

/// Tagged union of every operation the state machine can apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Command {
    CreateProject {
        id: String,
        name: String,
        description: String,
        owner_id: String,
    },
    UpdateProject {
        id: String,
        name: Option<String>,
        description: Option<String>,
    },
    DeleteProject {
        id: String,
    },
    GitCommit {
        repository_id: String,
        branch_name: String,
        message: String,
        author: String,
        files: Vec<FileChange>,
    },
    GitCreateBranch {
        repository_id: String,
        branch_name: String,
        from_branch: Option<String>,
    },
    GitMerge {
        repository_id: String,
        source_branch: String,
        target_branch: String,
        message: String,
        author: String,
    },
    CreateFile {
        repository_id: String,
        branch_name: Option<String>,
        path: String,
        content: String,
        author: String,
    },
    UpdateFile {
        repository_id: String,
        branch_name: Option<String>,
        path: String,
        content: String,
        author: String,
    },
    DeleteFile {
        repository_id: String,
        branch_name: Option<String>,
        path: String,
        author: String,
    },
}

impl Command {
    /// Default branch commands fall back to when no branch is specified.
    pub const DEFAULT_BRANCH: &'static str = "main";
}

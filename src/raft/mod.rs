// Raft Node — the consensus core. Role state machine,
// election/heartbeat timers, RequestVote/AppendEntries handling, leader
// replication bookkeeping (`nextIndex`/`matchIndex`), commit advancement,
// and the client-write entry point all live here; storage, transport, and
// the state machine are injected as trait objects so the node is agnostic
// to their concrete implementation (file vs. memory store, websocket vs.
// in-memory transport).

pub mod events;
mod node;

pub use events::NodeEvent;
pub use node::{NodeStatus, RaftNode, TimingConfig};

use serde::{Deserialize, Serialize};

/// The three Raft roles. `Follower` is both the initial and terminal state
/// for the life of the node unless it wins an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

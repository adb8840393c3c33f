// forge-raft — Raft consensus engine and replicated Git-oriented state
// machine. The five cooperating components are exposed as public modules,
// built bottom-up: `storage` (persistent term/vote/log),
// `state_machine` (deterministic command interpreter + snapshots),
// `transport` (inter-node RPC), `raft` (the consensus core), and `cluster`
// (the lifecycle supervisor an external HTTP layer wraps).

pub mod cluster;
pub mod config;
pub mod error;
pub mod raft;
pub mod state_machine;
pub mod storage;
pub mod transport;
pub mod types;

pub use cluster::{ClientResponse, ClusterMetrics, ClusterService, ClusterStatus, HealthCheck};
pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use types::{Command, FileChange, LogEntry, LogIndex, NodeId, Term};

/// Crate version, surfaced on the admin `status`/`config` surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

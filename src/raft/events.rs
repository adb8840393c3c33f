// Lifecycle events the node hands to whoever is watching — the cluster
// service drains these into `tracing` spans rather than the source's
// string-keyed in-process emitter.

use crate::types::{LogIndex, NodeId, Term};
use super::Role;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    StateChanged { role: Role, term: Term },
    LeaderElected { leader_id: NodeId, term: Term },
    LogCommitted { index: LogIndex },
    Error { message: String },
}

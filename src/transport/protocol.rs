// Wire contract: two RPC kinds (RequestVote, AppendEntries) and their
// responses, each message carrying a `requestId` echoed by the matching
// reply. Framing is JSON text over a WebSocket connection.

use crate::types::{LogEntry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub conflict_index: Option<LogIndex>,
    pub conflict_term: Option<Term>,
}

/// Request-side payload union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum RaftRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

/// Response-side payload union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum RaftResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

/// Framed envelope: one frame == one message, `request_id` correlates a
/// response back to the request that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: Uuid,
    pub from: NodeId,
    pub message: Frame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request(RaftRequest),
    Response(RaftResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope {
            request_id: Uuid::new_v4(),
            from: NodeId::new("n1"),
            message: Frame::Request(RaftRequest::RequestVote(RequestVoteRequest {
                term: 1,
                candidate_id: NodeId::new("n1"),
                last_log_index: 0,
                last_log_term: 0,
            })),
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, env.request_id);
    }
}

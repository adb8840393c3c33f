// Transport — bidirectional, connection-oriented RPC between peers.
// Connection churn is not the caller's concern: implementations reconnect
// on demand. Transport errors (connect failure, send failure, timeout,
// server stop) surface as failed futures; the Raft node retries at the
// next heartbeat rather than relying on an in-transport retry queue.

pub mod memory;
pub mod protocol;
pub mod websocket;

pub use protocol::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
pub use websocket::WebSocketTransport;

use crate::error::Result;
use crate::types::NodeId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Invoked by the transport for every inbound request; the Raft node is
/// the sole implementor in production, tests may substitute a stub.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse>;
    async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Binds the endpoint for `node_id` and begins accepting inbound peer
    /// connections, dispatching every request to `handler`.
    async fn start_server(&self, node_id: NodeId, handler: Arc<dyn RpcHandler>) -> Result<()>;

    /// Closes the listener, closes all connections, and fails every
    /// in-flight outstanding request with a terminal error.
    async fn stop_server(&self) -> Result<()>;

    async fn send_request_vote(
        &self,
        peer: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn send_append_entries(
        &self,
        peer: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Static peer discovery: node-id -> (host, port), supplied at construction.
#[derive(Debug, Clone, Default)]
pub struct PeerMap(pub HashMap<NodeId, (String, u16)>);

impl PeerMap {
    pub fn new(peers: HashMap<NodeId, (String, u16)>) -> Self {
        Self(peers)
    }

    pub fn endpoint(&self, node_id: &NodeId) -> Option<&(String, u16)> {
        self.0.get(node_id)
    }
}

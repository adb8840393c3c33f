// In-process `Transport` used by integration tests: peers are looked up in
// a shared switchboard and invoked directly, with an injectable "online"
// flag per node so tests can simulate stopped nodes and partitions without
// opening real sockets.

use super::protocol::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use super::{RpcHandler, Transport};
use crate::error::{ClusterError, Result};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Default)]
pub struct MemoryNetwork {
    handlers: DashMap<NodeId, Arc<dyn RpcHandler>>,
    online: DashMap<NodeId, bool>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulates stopping/starting a node's reachability without removing
    /// its registered handler.
    pub fn set_online(&self, node_id: &NodeId, online: bool) {
        self.online.insert(node_id.clone(), online);
    }

    fn is_online(&self, node_id: &NodeId) -> bool {
        self.online.get(node_id).map(|v| *v).unwrap_or(true)
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    rpc_timeout: Duration,
    self_id: once_cell::sync::OnceCell<NodeId>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>, rpc_timeout: Duration) -> Self {
        Self {
            network,
            rpc_timeout,
            self_id: once_cell::sync::OnceCell::new(),
        }
    }

    async fn dispatch<F, Fut, T>(&self, peer: &NodeId, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn RpcHandler>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        // A node marked offline is unreachable in both directions: it can't
        // be called, and its own outbound calls don't go through either —
        // otherwise a "stopped" node in a partition test could still win
        // votes by calling out to nodes that refuse to call it back.
        if let Some(id) = self.self_id.get() {
            if !self.network.is_online(id) {
                return Err(ClusterError::Transport("this node is offline".into()));
            }
        }
        if !self.network.is_online(peer) {
            return Err(ClusterError::Transport(format!("peer {} unreachable", peer)));
        }
        let handler = self
            .network
            .handlers
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::Transport(format!("no such peer {}", peer)))?;

        match timeout(self.rpc_timeout, f(handler)).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(self.rpc_timeout)),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start_server(&self, node_id: NodeId, handler: Arc<dyn RpcHandler>) -> Result<()> {
        let _ = self.self_id.set(node_id.clone());
        self.network.handlers.insert(node_id.clone(), handler);
        self.network.online.insert(node_id, true);
        Ok(())
    }

    async fn stop_server(&self) -> Result<()> {
        // Individual node shutdown is driven by `MemoryNetwork::set_online`
        // in tests; a process-wide transport stop has nothing further to
        // release for the in-memory switchboard.
        Ok(())
    }

    async fn send_request_vote(
        &self,
        peer: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.dispatch(peer, move |h| async move { h.handle_request_vote(req).await })
            .await
    }

    async fn send_append_entries(
        &self,
        peer: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.dispatch(peer, move |h| async move { h.handle_append_entries(req).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle_request_vote(
            &self,
            req: RequestVoteRequest,
        ) -> Result<RequestVoteResponse> {
            Ok(RequestVoteResponse {
                term: req.term,
                vote_granted: true,
            })
        }

        async fn handle_append_entries(
            &self,
            req: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            Ok(AppendEntriesResponse {
                term: req.term,
                success: true,
                conflict_index: None,
                conflict_term: None,
            })
        }
    }

    fn vote_req(term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: NodeId::new("candidate"),
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn offline_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = MemoryTransport::new(network.clone(), Duration::from_millis(50));
        let b = MemoryTransport::new(network.clone(), Duration::from_millis(50));
        a.start_server(NodeId::new("a"), Arc::new(EchoHandler)).await.unwrap();
        b.start_server(NodeId::new("b"), Arc::new(EchoHandler)).await.unwrap();

        network.set_online(&NodeId::new("b"), false);
        assert!(a.send_request_vote(&NodeId::new("b"), vote_req(1)).await.is_err());
    }

    #[tokio::test]
    async fn offline_node_cannot_place_outbound_calls_either() {
        let network = MemoryNetwork::new();
        let a = MemoryTransport::new(network.clone(), Duration::from_millis(50));
        let b = MemoryTransport::new(network.clone(), Duration::from_millis(50));
        a.start_server(NodeId::new("a"), Arc::new(EchoHandler)).await.unwrap();
        b.start_server(NodeId::new("b"), Arc::new(EchoHandler)).await.unwrap();

        network.set_online(&NodeId::new("a"), false);
        assert!(a.send_request_vote(&NodeId::new("b"), vote_req(1)).await.is_err());
    }

    #[tokio::test]
    async fn reachable_peer_responds() {
        let network = MemoryNetwork::new();
        let a = MemoryTransport::new(network.clone(), Duration::from_millis(50));
        let b = MemoryTransport::new(network.clone(), Duration::from_millis(50));
        a.start_server(NodeId::new("a"), Arc::new(EchoHandler)).await.unwrap();
        b.start_server(NodeId::new("b"), Arc::new(EchoHandler)).await.unwrap();

        let resp = a.send_request_vote(&NodeId::new("b"), vote_req(3)).await.unwrap();
        assert!(resp.vote_granted);
        assert_eq!(resp.term, 3);
    }
}

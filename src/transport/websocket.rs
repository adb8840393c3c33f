// WebSocket-backed `Transport`: one accept loop per bound port, one read
// loop per connection, outstanding requests indexed by `requestId` to a
// oneshot waiter. Connections are bidirectional —
// the same socket carries both directions' `Envelope`s, so a single read
// loop per connection either dispatches an inbound request to the RPC
// handler or completes a pending outbound request.

use super::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, Frame, RaftRequest, RaftResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use super::{PeerMap, RpcHandler, Transport};
use crate::error::{ClusterError, Result};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type PendingMap = Arc<DashMap<Uuid, oneshot::Sender<RaftResponse>>>;
type OutboundTx = mpsc::UnboundedSender<WsMessage>;

pub struct WebSocketTransport {
    peers: PeerMap,
    rpc_timeout: Duration,
    self_id: OnceCell<NodeId>,
    connections: Arc<DashMap<NodeId, OutboundTx>>,
    pending: PendingMap,
    handler: OnceCell<Arc<dyn RpcHandler>>,
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    /// Reader/writer task handles for every connection spawned by
    /// `spawn_connection`/`spawn_inbound`, drained and aborted in
    /// `stop_server` so no socket outlives the transport.
    conn_tasks: Arc<std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl WebSocketTransport {
    pub fn new(peers: PeerMap, rpc_timeout: Duration) -> Self {
        Self {
            peers,
            rpc_timeout,
            self_id: OnceCell::new(),
            connections: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            handler: OnceCell::new(),
            listener_task: Mutex::new(None),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            conn_tasks: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    fn self_id(&self) -> NodeId {
        self.self_id
            .get()
            .cloned()
            .unwrap_or_else(|| NodeId::new("unknown"))
    }

    async fn ensure_connection(&self, peer: &NodeId) -> Result<OutboundTx> {
        if let Some(tx) = self.connections.get(peer) {
            return Ok(tx.clone());
        }
        let (host, port) = self
            .peers
            .endpoint(peer)
            .ok_or_else(|| ClusterError::Transport(format!("unknown peer {}", peer)))?;
        let url = format!("ws://{}:{}", host, port);
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|e| ClusterError::Transport(format!("connect to {} failed: {}", peer, e)))?;
        let tx = self.spawn_connection(stream);
        self.connections.insert(peer.clone(), tx.clone());
        Ok(tx)
    }

    fn spawn_connection(&self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> OutboundTx {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let handler = self.handler.get().cloned();
        let reply_tx = tx.clone();
        let stopped = self.stopped.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = source.next().await {
                if stopped.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                let WsMessage::Text(text) = msg else {
                    continue;
                };
                let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
                    tracing::warn!("dropping malformed transport frame");
                    continue;
                };
                match envelope.message {
                    Frame::Response(resp) => {
                        if let Some((_, waiter)) = pending.remove(&envelope.request_id) {
                            let _ = waiter.send(resp);
                        }
                    }
                    Frame::Request(req) => {
                        let Some(handler) = handler.clone() else {
                            continue;
                        };
                        let reply_tx = reply_tx.clone();
                        let request_id = envelope.request_id;
                        let from = envelope.from.clone();
                        tokio::spawn(async move {
                            let response = dispatch(handler, req).await;
                            if let Ok(response) = response {
                                let reply = Envelope {
                                    request_id,
                                    from,
                                    message: Frame::Response(response),
                                };
                                if let Ok(text) = serde_json::to_string(&reply) {
                                    let _ = reply_tx.send(WsMessage::Text(text.into()));
                                }
                            }
                        });
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.conn_tasks.lock() {
            tasks.push(writer);
            tasks.push(reader);
        }

        tx
    }

    async fn call(&self, peer: &NodeId, request: RaftRequest) -> Result<RaftResponse> {
        if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ClusterError::Transport("transport stopped".into()));
        }
        let tx = self.ensure_connection(peer).await?;
        let request_id = Uuid::new_v4();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.insert(request_id, waiter_tx);

        let envelope = Envelope {
            request_id,
            from: self.self_id(),
            message: Frame::Request(request),
        };
        let text = serde_json::to_string(&envelope)?;
        if tx.send(WsMessage::Text(text.into())).is_err() {
            self.pending.remove(&request_id);
            self.connections.remove(peer);
            return Err(ClusterError::Transport(format!("send to {} failed", peer)));
        }

        match timeout(self.rpc_timeout, waiter_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClusterError::Transport("waiter dropped".into())),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(ClusterError::Timeout(self.rpc_timeout))
            }
        }
    }
}

async fn dispatch(handler: Arc<dyn RpcHandler>, request: RaftRequest) -> Result<RaftResponse> {
    match request {
        RaftRequest::RequestVote(req) => {
            handler.handle_request_vote(req).await.map(RaftResponse::RequestVote)
        }
        RaftRequest::AppendEntries(req) => handler
            .handle_append_entries(req)
            .await
            .map(RaftResponse::AppendEntries),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start_server(&self, node_id: NodeId, handler: Arc<dyn RpcHandler>) -> Result<()> {
        let _ = self.self_id.set(node_id.clone());
        let _ = self.handler.set(handler);

        let (host, port) = self
            .peers
            .endpoint(&node_id)
            .ok_or_else(|| ClusterError::Configuration(format!("no endpoint for {}", node_id)))?;
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ClusterError::Transport(format!("bind {} failed: {}", addr, e)))?;

        let connections = self.connections.clone();
        let pending = self.pending.clone();
        let handler_cell_handler = self.handler.get().cloned();
        let stopped = self.stopped.clone();
        let self_for_accept = WebSocketTransportHandles {
            connections: connections.clone(),
            pending: pending.clone(),
            handler: handler_cell_handler,
            stopped: stopped.clone(),
            conn_tasks: self.conn_tasks.clone(),
        };

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if stopped.load(std::sync::atomic::Ordering::SeqCst) {
                            break;
                        }
                        let accepted = match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to complete websocket handshake");
                                continue;
                            }
                        };
                        self_for_accept.spawn_inbound(accepted);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept loop error");
                        break;
                    }
                }
            }
        });
        *self.listener_task.lock().await = Some(task);
        tracing::info!(node = %node_id, %addr, "transport listening");
        Ok(())
    }

    async fn stop_server(&self) -> Result<()> {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }
        // Abort every connection's reader/writer tasks so no socket stays
        // open past this call returning, then drop the connection table.
        if let Ok(mut tasks) = self.conn_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.connections.clear();
        for entry in self.pending.iter() {
            let _ = entry.value();
        }
        self.pending.clear();
        Ok(())
    }

    async fn send_request_vote(
        &self,
        peer: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.call(peer, RaftRequest::RequestVote(req)).await? {
            RaftResponse::RequestVote(resp) => Ok(resp),
            _ => Err(ClusterError::Internal("mismatched response kind".into())),
        }
    }

    async fn send_append_entries(
        &self,
        peer: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(peer, RaftRequest::AppendEntries(req)).await? {
            RaftResponse::AppendEntries(resp) => Ok(resp),
            _ => Err(ClusterError::Internal("mismatched response kind".into())),
        }
    }
}

/// Plain-data handle bundle so the accept loop can spawn per-connection
/// tasks without borrowing `WebSocketTransport` across `.await`.
struct WebSocketTransportHandles {
    connections: Arc<DashMap<NodeId, OutboundTx>>,
    pending: PendingMap,
    handler: Option<Arc<dyn RpcHandler>>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    conn_tasks: Arc<std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl WebSocketTransportHandles {
    fn spawn_inbound(&self, stream: WebSocketStream<TcpStream>) {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let handler = self.handler.clone();
        let reply_tx = tx.clone();
        let connections = self.connections.clone();
        let stopped = self.stopped.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = source.next().await {
                if stopped.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                let WsMessage::Text(text) = msg else {
                    continue;
                };
                let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
                    continue;
                };
                // First message from a peer registers it so replies route
                // back over this same connection.
                connections
                    .entry(envelope.from.clone())
                    .or_insert_with(|| reply_tx.clone());

                match envelope.message {
                    Frame::Response(resp) => {
                        if let Some((_, waiter)) = pending.remove(&envelope.request_id) {
                            let _ = waiter.send(resp);
                        }
                    }
                    Frame::Request(req) => {
                        let Some(handler) = handler.clone() else {
                            continue;
                        };
                        let reply_tx = reply_tx.clone();
                        let request_id = envelope.request_id;
                        let from = envelope.from.clone();
                        tokio::spawn(async move {
                            if let Ok(response) = dispatch(handler, req).await {
                                let reply = Envelope {
                                    request_id,
                                    from,
                                    message: Frame::Response(response),
                                };
                                if let Ok(text) = serde_json::to_string(&reply) {
                                    let _ = reply_tx.send(WsMessage::Text(text.into()));
                                }
                            }
                        });
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.conn_tasks.lock() {
            tasks.push(writer);
            tasks.push(reader);
        }
    }
}

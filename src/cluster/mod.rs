// Cluster Service — lifecycle supervisor over the Raft node.
// Loads configuration, wires the four lower components, exposes
// start/stop/restart and the admin surface (`status`, `metrics`, `config`,
// `health`, `execute_command`), and drains node lifecycle events into
// `tracing` spans in a background task.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::raft::{NodeEvent, NodeStatus, RaftNode, Role, TimingConfig};
use crate::state_machine::{CommandOutcome, GitStateMachine, StateMachine};
use crate::storage::{FileStore, PersistentStore};
use crate::transport::{Transport, WebSocketTransport};
use crate::types::{Command, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Response shape returned to the HTTP collaborator for a submitted write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub leader_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub peer_count: usize,
    pub leader_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub total_commands: u64,
    pub leader_elections: u64,
    pub average_response_time_ms: f64,
    pub uptime_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub healthy: bool,
    pub role: Role,
}

#[derive(Default)]
struct Metrics {
    total_commands: AtomicU64,
    leader_elections: AtomicU64,
    total_response_time_ms: AtomicU64,
    response_samples: AtomicU64,
}

impl Metrics {
    fn record_command(&self, elapsed: Duration) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.response_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn record_election(&self) {
        self.leader_elections.fetch_add(1, Ordering::Relaxed);
    }

    fn average_response_time_ms(&self) -> f64 {
        let samples = self.response_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.total_response_time_ms.load(Ordering::Relaxed) as f64 / samples as f64
    }
}

pub struct ClusterService {
    config: ClusterConfig,
    node: Arc<RaftNode>,
    metrics: Arc<Metrics>,
    started_at: Mutex<Option<Instant>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClusterService {
    /// Production wiring: `FileStore` under `config.data_dir`, the real
    /// `GitStateMachine`, and a `WebSocketTransport` over the configured
    /// peer map.
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        let store: Arc<dyn PersistentStore> =
            Arc::new(FileStore::open(&config.data_dir, &config.node_id).await?);
        let state_machine: Arc<dyn StateMachine> = Arc::new(GitStateMachine::new());
        let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(
            config.peer_map.clone(),
            config.timing.rpc_timeout,
        ));
        Ok(Self::from_parts(config, store, state_machine, transport))
    }

    /// Test/embedding entry point: caller supplies its own component
    /// implementations (e.g. `MemoryStore` + `MemoryTransport`).
    pub fn from_parts(
        config: ClusterConfig,
        store: Arc<dyn PersistentStore>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let node = RaftNode::new(
            config.node_id.clone(),
            config.peers.clone(),
            store,
            state_machine,
            transport,
            config.timing,
        );
        Self {
            config,
            node,
            metrics: Arc::new(Metrics::default()),
            started_at: Mutex::new(None),
            event_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub async fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<NodeEvent>();
        self.node.start(tx).await?;
        *self.started_at.lock().await = Some(Instant::now());

        let metrics = self.metrics.clone();
        let node_id = self.config.node_id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    NodeEvent::StateChanged { role, term } => {
                        tracing::info!(node = %node_id, %role, term, "role changed");
                    }
                    NodeEvent::LeaderElected { leader_id, term } => {
                        metrics.record_election();
                        tracing::info!(node = %node_id, %leader_id, term, "leader elected");
                    }
                    NodeEvent::LogCommitted { index } => {
                        tracing::debug!(node = %node_id, index, "log committed");
                    }
                    NodeEvent::Error { message } => {
                        tracing::error!(node = %node_id, message, "raft node error");
                    }
                }
            }
        });
        *self.event_task.lock().await = Some(task);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.node.stop().await?;
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        *self.started_at.lock().await = None;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.start().await
    }

    pub async fn execute_command(&self, command: Command) -> ClientResponse {
        let started = Instant::now();
        let response = match self.node.client_write(command).await {
            Ok(CommandOutcome::Applied(value)) => ClientResponse {
                success: true,
                data: Some(value),
                error: None,
                leader_id: None,
            },
            Ok(CommandOutcome::Rejected(reason)) => ClientResponse {
                success: false,
                data: None,
                error: Some(reason),
                leader_id: None,
            },
            Err(ClusterError::NotLeader { leader_id }) => ClientResponse {
                success: false,
                data: None,
                error: Some("not the leader".to_string()),
                leader_id,
            },
            Err(err) => ClientResponse {
                success: false,
                data: None,
                error: Some(err.to_string()),
                leader_id: None,
            },
        };
        self.metrics.record_command(started.elapsed());
        response
    }

    pub fn status(&self) -> ClusterStatus {
        let status: NodeStatus = self.node.status();
        ClusterStatus {
            node_id: status.node_id,
            role: status.role,
            term: status.term,
            peer_count: status.peer_count,
            leader_id: status.leader_id,
        }
    }

    pub async fn metrics(&self) -> ClusterMetrics {
        let uptime_ms = match *self.started_at.lock().await {
            Some(started) => started.elapsed().as_millis(),
            None => 0,
        };
        ClusterMetrics {
            total_commands: self.metrics.total_commands.load(Ordering::Relaxed),
            leader_elections: self.metrics.leader_elections.load(Ordering::Relaxed),
            average_response_time_ms: self.metrics.average_response_time_ms(),
            uptime_ms,
        }
    }

    pub fn health(&self) -> HealthCheck {
        let status = self.status();
        HealthCheck {
            healthy: true,
            role: status.role,
        }
    }
}

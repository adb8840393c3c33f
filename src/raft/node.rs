use super::{NodeEvent, Role};
use crate::error::{ClusterError, Result};
use crate::state_machine::{CommandOutcome, StateMachine};
use crate::storage::PersistentStore;
use crate::transport::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    RpcHandler, Transport,
};
use crate::types::{Command, LogEntry, LogIndex, NodeId, Term};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

/// Randomized timer and per-call timeout settings. Typical defaults: a
/// 150-450ms election timeout range, 100ms heartbeat interval, 100ms RPC
/// timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub commit_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(450),
            heartbeat_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(100),
            commit_timeout: Duration::from_secs(5),
        }
    }
}

/// How often a running node checks whether its applied state has moved far
/// enough past the last snapshot to justify writing a new one.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub peer_count: usize,
}

#[derive(Default)]
struct RaftState {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    /// Command results keyed by log index, populated as entries are
    /// applied; `client_write` polls this to resolve its caller.
    applied_results: BTreeMap<LogIndex, CommandOutcome>,
}

/// Decision reached while holding the state lock in `handle_append_entries`,
/// acted on afterwards so no `PersistentStore`/transport `.await` ever
/// happens while the lock is held.
enum AppendDecision {
    StaleTerm(Term),
    LogConflict {
        adopt_term: Option<Term>,
        conflict_index: LogIndex,
        conflict_term: Option<Term>,
    },
    Accept {
        adopt_term: Option<Term>,
        truncate_from: Option<LogIndex>,
        new_entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
}

fn plan_append(state: &RaftState, req: &AppendEntriesRequest) -> (Option<LogIndex>, Vec<LogEntry>) {
    for (i, entry) in req.entries.iter().enumerate() {
        let idx = req.prev_log_index + 1 + i as LogIndex;
        match state.log.get((idx - 1) as usize) {
            Some(existing) if existing.term == entry.term => continue,
            Some(_) => return (Some(idx), req.entries[i..].to_vec()),
            None => return (None, req.entries[i..].to_vec()),
        }
    }
    (None, Vec::new())
}

/// The consensus core. Every public method is safe to call concurrently;
/// the single `parking_lot::RwLock` over `RaftState` is never held across
/// an `.await` point — callers compute a plan under the lock, drop it, then
/// perform storage/transport/network awaits before re-acquiring to commit
/// the result.
pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    store: Arc<dyn PersistentStore>,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    timing: TimingConfig,
    state: RwLock<RaftState>,
    commit_watch_tx: watch::Sender<LogIndex>,
    commit_watch_rx: watch::Receiver<LogIndex>,
    events_tx: OnceCell<mpsc::UnboundedSender<NodeEvent>>,
    reset_election: Notify,
    shutdown: AtomicBool,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    /// Serializes `client_write` end to end (index reservation through
    /// persist through the `state.log` push) so two concurrent writers
    /// can't reserve the same index before either has durably saved it.
    client_write_lock: AsyncMutex<()>,
    /// `lastAppliedIndex` as of the most recently persisted snapshot.
    last_snapshot_index: AtomicU64,
}

impl RaftNode {
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        store: Arc<dyn PersistentStore>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        timing: TimingConfig,
    ) -> Arc<Self> {
        let (commit_watch_tx, commit_watch_rx) = watch::channel(0);
        Arc::new(Self {
            id,
            peers,
            store,
            state_machine,
            transport,
            timing,
            state: RwLock::new(RaftState::default()),
            commit_watch_tx,
            commit_watch_rx,
            events_tx: OnceCell::new(),
            reset_election: Notify::new(),
            shutdown: AtomicBool::new(true),
            tasks: AsyncMutex::new(Vec::new()),
            client_write_lock: AsyncMutex::new(()),
            last_snapshot_index: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.read();
        NodeStatus {
            node_id: self.id.clone(),
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id.clone(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            peer_count: self.peers.len(),
        }
    }

    pub async fn start(self: &Arc<Self>, events_tx: mpsc::UnboundedSender<NodeEvent>) -> Result<()> {
        let _ = self.events_tx.set(events_tx);
        let persisted = self.store.load_state().await?;
        {
            let mut state = self.state.write();
            state.current_term = persisted.current_term;
            state.voted_for = persisted.voted_for;
            state.log = persisted.log;
        }

        // Install the last snapshot, if any, before this node starts
        // serving: a recovering node should resume from the state the
        // snapshot captured rather than replaying its entire history.
        if let Some(blob) = self.store.load_snapshot().await? {
            self.state_machine.restore_from_snapshot(&blob)?;
            let summary = self.state_machine.get_state();
            let mut state = self.state.write();
            state.last_applied = summary.last_applied_index;
            state.commit_index = state.commit_index.max(summary.last_applied_index);
            drop(state);
            self.last_snapshot_index
                .store(summary.last_applied_index, Ordering::Relaxed);
        }

        self.shutdown.store(false, Ordering::SeqCst);

        let handler: Arc<dyn RpcHandler> = self.clone();
        self.transport.start_server(self.id.clone(), handler).await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().election_timer_loop()));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));
        tasks.push(tokio::spawn(self.clone().snapshot_loop()));
        tracing::info!(node = %self.id, "raft node started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.reset_election.notify_waiters();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.transport.stop_server().await?;
        tracing::info!(node = %self.id, "raft node stopped");
        Ok(())
    }

    /// Appends `command` to the leader's log, replicates it, and waits for
    /// commit (success), `COMMIT_TIMEOUT` (failure), or loss of leadership
    /// (failure).
    pub async fn client_write(self: &Arc<Self>, command: Command) -> Result<CommandOutcome> {
        // Held for the full reserve-persist-commit sequence below so two
        // concurrent callers can't reserve the same log index before either
        // has durably saved it.
        let _write_guard = self.client_write_lock.lock().await;

        let (index, term) = {
            let state = self.state.read();
            if state.role != Role::Leader {
                return Err(ClusterError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }
            (state.log.len() as LogIndex + 1, state.current_term)
        };
        let entry = LogEntry::new(index, term, command, chrono::Utc::now().timestamp_millis());

        // Persist before the entry becomes visible in `state.log`: if this
        // fails, the leader must not act as though the write happened, and
        // `replicate_to_peer` (which reads straight from `state.log`) must
        // never see an entry the leader itself didn't durably store.
        self.store.save_log_entry(entry.clone()).await?;

        {
            let mut state = self.state.write();
            if state.role != Role::Leader || state.current_term != term {
                return Err(ClusterError::NoLongerLeader);
            }
            state.log.push(entry);
        }

        self.replicate_to_all().await;

        let mut rx = self.commit_watch_rx.clone();
        let deadline = tokio::time::Instant::now() + self.timing.commit_timeout;
        loop {
            {
                let state = self.state.read();
                if state.role != Role::Leader {
                    return Err(ClusterError::NoLongerLeader);
                }
                if let Some(outcome) = state.applied_results.get(&index) {
                    return Ok(outcome.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::CommitTimeout);
            }
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        if let Some(tx) = self.events_tx.get() {
            let _ = tx.send(event);
        }
    }

    async fn election_timer_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let wait = random_election_timeout(
                self.timing.election_timeout_min,
                self.timing.election_timeout_max,
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let is_leader = self.state.read().role == Role::Leader;
                    if !is_leader {
                        self.start_election().await;
                    }
                }
                _ = self.reset_election.notified() => {}
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.timing.heartbeat_interval);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let is_leader = self.state.read().role == Role::Leader;
            if is_leader {
                self.replicate_to_all().await;
            }
        }
    }

    async fn snapshot_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.maybe_save_snapshot().await;
        }
    }

    /// Persists a fresh snapshot if applied state has advanced past the
    /// last one saved. Any failure here is logged and left for the next
    /// tick to retry; it never affects liveness or leadership.
    async fn maybe_save_snapshot(&self) {
        let last_applied = self.state.read().last_applied;
        if last_applied == 0 || last_applied <= self.last_snapshot_index.load(Ordering::Relaxed) {
            return;
        }
        let blob = match self.state_machine.create_snapshot() {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(node = %self.id, error = %e, "failed to encode snapshot");
                return;
            }
        };
        match self.store.save_snapshot(&blob).await {
            Ok(()) => {
                self.last_snapshot_index.store(last_applied, Ordering::Relaxed);
                tracing::debug!(node = %self.id, index = last_applied, "snapshot saved");
            }
            Err(e) => {
                tracing::warn!(node = %self.id, error = %e, "failed to persist snapshot");
            }
        }
    }

    async fn start_election(self: &Arc<Self>) {
        // Compute the candidate term/log tail without mutating anything yet:
        // `currentTerm`/`votedFor` must not advance in memory until both are
        // durably persisted, or a storage failure here would leave the node
        // believing it is a candidate in a term it never actually recorded.
        let (next_term, last_log_index, last_log_term) = {
            let state = self.state.read();
            let last_log_index = state.log.last().map(|e| e.index).unwrap_or(0);
            let last_log_term = state.log.last().map(|e| e.term).unwrap_or(0);
            (state.current_term + 1, last_log_index, last_log_term)
        };

        if self.store.save_term(next_term).await.is_err() {
            return;
        }
        if self
            .store
            .save_voted_for(Some(self.id.clone()))
            .await
            .is_err()
        {
            return;
        }

        let term = {
            let mut state = self.state.write();
            state.current_term = next_term;
            state.role = Role::Candidate;
            state.voted_for = Some(self.id.clone());
            state.leader_id = None;
            state.current_term
        };

        self.emit(NodeEvent::StateChanged {
            role: Role::Candidate,
            term,
        });
        tracing::info!(node = %self.id, term, "starting election");

        let req = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };
        let responses = futures_util::future::join_all(self.peers.iter().map(|peer| {
            let this = self.clone();
            let req = req.clone();
            let peer = peer.clone();
            async move { this.transport.send_request_vote(&peer, req).await }
        }))
        .await;

        let mut votes = 1usize;
        let mut higher_term = None;
        for resp in responses.into_iter().flatten() {
            if resp.term > term {
                higher_term = Some(resp.term.max(higher_term.unwrap_or(0)));
            } else if resp.vote_granted {
                votes += 1;
            }
        }

        if let Some(new_term) = higher_term {
            self.step_down(new_term).await;
            return;
        }

        let total_nodes = self.peers.len() + 1;
        let majority = total_nodes / 2 + 1;

        let became_leader = {
            let mut state = self.state.write();
            if state.role != Role::Candidate || state.current_term != term {
                false
            } else if votes >= majority {
                state.role = Role::Leader;
                state.leader_id = Some(self.id.clone());
                let next = state.log.len() as LogIndex + 1;
                for peer in &self.peers {
                    state.next_index.insert(peer.clone(), next);
                    state.match_index.insert(peer.clone(), 0);
                }
                true
            } else {
                false
            }
        };

        if became_leader {
            self.emit(NodeEvent::LeaderElected {
                leader_id: self.id.clone(),
                term,
            });
            tracing::info!(node = %self.id, term, "elected leader");
            self.replicate_to_all().await;
        }
    }

    async fn step_down(&self, new_term: Term) {
        let changed = {
            let mut state = self.state.write();
            if new_term < state.current_term {
                false
            } else {
                state.current_term = new_term;
                state.role = Role::Follower;
                state.voted_for = None;
                state.leader_id = None;
                true
            }
        };
        if changed {
            let _ = self.store.save_term(new_term).await;
            self.emit(NodeEvent::StateChanged {
                role: Role::Follower,
                term: new_term,
            });
        }
    }

    async fn replicate_to_all(self: &Arc<Self>) {
        let peers = self.peers.clone();
        futures_util::future::join_all(
            peers
                .iter()
                .map(|peer| {
                    let this = self.clone();
                    let peer = peer.clone();
                    async move { this.replicate_to_peer(&peer).await }
                }),
        )
        .await;
        self.try_advance_commit();
    }

    async fn replicate_to_peer(self: &Arc<Self>, peer: &NodeId) {
        let plan = {
            let state = self.state.read();
            if state.role != Role::Leader {
                return;
            }
            let next_idx = *state.next_index.get(peer).unwrap_or(&1);
            let prev_log_index = next_idx.saturating_sub(1);
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                state
                    .log
                    .get((prev_log_index - 1) as usize)
                    .map(|e| e.term)
                    .unwrap_or(0)
            };
            let entries: Vec<LogEntry> = state
                .log
                .iter()
                .filter(|e| e.index >= next_idx)
                .cloned()
                .collect();
            (
                state.current_term,
                next_idx,
                prev_log_index,
                prev_log_term,
                entries,
                state.commit_index,
            )
        };
        let (term, next_idx, prev_log_index, prev_log_term, entries, leader_commit) = plan;

        let req = AppendEntriesRequest {
            term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: entries.clone(),
            leader_commit,
        };

        let resp: AppendEntriesResponse = match self.transport.send_append_entries(peer, req).await {
            Ok(resp) => resp,
            Err(_) => return,
        };

        if resp.term > term {
            self.step_down(resp.term).await;
            return;
        }

        let mut state = self.state.write();
        if state.role != Role::Leader || state.current_term != term {
            return;
        }
        if resp.success {
            let match_idx = (next_idx + entries.len() as LogIndex)
                .saturating_sub(1)
                .max(prev_log_index);
            state.match_index.insert(peer.clone(), match_idx);
            state.next_index.insert(peer.clone(), match_idx + 1);
        } else {
            let fallback = resp
                .conflict_index
                .unwrap_or_else(|| next_idx.saturating_sub(1).max(1));
            state.next_index.insert(peer.clone(), fallback.max(1));
        }
    }

    /// Leader-side commit advancement: only entries of the current term may
    /// be committed directly (Raft safety §5.4.2).
    fn try_advance_commit(&self) {
        let mut state = self.state.write();
        if state.role != Role::Leader {
            return;
        }
        let current_term = state.current_term;
        let peers: Vec<NodeId> = state.match_index.keys().cloned().collect();
        let majority = (peers.len() + 1) / 2 + 1;
        let log_len = state.log.len() as LogIndex;

        let mut new_commit = state.commit_index;
        for n in (state.commit_index + 1)..=log_len {
            if state.log[(n - 1) as usize].term != current_term {
                continue;
            }
            let replicants = 1 + peers
                .iter()
                .filter(|p| *state.match_index.get(*p).unwrap_or(&0) >= n)
                .count();
            if replicants >= majority {
                new_commit = n;
            }
        }

        if new_commit > state.commit_index {
            state.commit_index = new_commit;
            self.apply_committed(&mut state);
            let commit_index = state.commit_index;
            drop(state);
            let _ = self.commit_watch_tx.send(commit_index);
            self.emit(NodeEvent::LogCommitted { index: commit_index });
        }
    }

    /// Applies every entry from `lastApplied + 1` to `commitIndex`, in
    /// order. `StateMachine::apply` is synchronous, so this can run inside
    /// the `parking_lot` write guard without an `.await` point.
    fn apply_committed(&self, state: &mut RaftState) {
        while state.last_applied < state.commit_index {
            let next = state.last_applied + 1;
            let entry = state.log[(next - 1) as usize].clone();
            let outcome = self.state_machine.apply(&entry);
            state.applied_results.insert(next, outcome);
            state.last_applied = next;
        }
    }

    async fn handle_append_entries_inner(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        // Decide from a read-only snapshot first. `adopt_term` is only ever
        // persisted, never applied to `state`, until the store call below
        // returns: a failed `save_term` must leave this node's in-memory
        // term exactly where it was on disk.
        let decision = {
            let state = self.state.read();
            if req.term < state.current_term {
                AppendDecision::StaleTerm(state.current_term)
            } else {
                let adopt_term = if req.term > state.current_term {
                    Some(req.term)
                } else {
                    None
                };
                if req.prev_log_index > 0 {
                    match state.log.get((req.prev_log_index - 1) as usize) {
                        None => AppendDecision::LogConflict {
                            adopt_term,
                            conflict_index: state.log.len() as LogIndex,
                            conflict_term: None,
                        },
                        Some(e) if e.term != req.prev_log_term => AppendDecision::LogConflict {
                            adopt_term,
                            conflict_index: state.log.len() as LogIndex,
                            conflict_term: Some(e.term),
                        },
                        _ => {
                            let (truncate_from, new_entries) = plan_append(&state, &req);
                            AppendDecision::Accept {
                                adopt_term,
                                truncate_from,
                                new_entries,
                                leader_commit: req.leader_commit,
                            }
                        }
                    }
                } else {
                    let (truncate_from, new_entries) = plan_append(&state, &req);
                    AppendDecision::Accept {
                        adopt_term,
                        truncate_from,
                        new_entries,
                        leader_commit: req.leader_commit,
                    }
                }
            }
        };

        match decision {
            AppendDecision::StaleTerm(term) => Ok(AppendEntriesResponse {
                term,
                success: false,
                conflict_index: None,
                conflict_term: None,
            }),
            AppendDecision::LogConflict {
                adopt_term,
                conflict_index,
                conflict_term,
            } => {
                if let Some(new_term) = adopt_term {
                    self.store.save_term(new_term).await?;
                }

                let term = {
                    let mut state = self.state.write();
                    if let Some(new_term) = adopt_term {
                        if new_term > state.current_term {
                            state.current_term = new_term;
                            state.voted_for = None;
                        }
                    }
                    state.role = Role::Follower;
                    state.leader_id = Some(req.leader_id.clone());
                    state.current_term
                };
                // This is still a legitimate heartbeat from the current
                // leader, just one whose log check failed; the election
                // timer resets the same as it would on a clean accept.
                self.reset_election.notify_one();

                Ok(AppendEntriesResponse {
                    term,
                    success: false,
                    conflict_index: Some(conflict_index),
                    conflict_term,
                })
            }
            AppendDecision::Accept {
                adopt_term,
                truncate_from,
                new_entries,
                leader_commit,
            } => {
                if let Some(new_term) = adopt_term {
                    self.store.save_term(new_term).await?;
                }
                if let Some(from) = truncate_from {
                    self.store.truncate_log_from(from).await?;
                }
                for entry in &new_entries {
                    self.store.save_log_entry(entry.clone()).await?;
                }

                let (term, commit_index) = {
                    let mut state = self.state.write();
                    if let Some(new_term) = adopt_term {
                        if new_term > state.current_term {
                            state.current_term = new_term;
                            state.voted_for = None;
                        }
                    }
                    state.role = Role::Follower;
                    state.leader_id = Some(req.leader_id.clone());

                    if let Some(from) = truncate_from {
                        state.log.truncate((from - 1) as usize);
                    }
                    for entry in new_entries {
                        if (entry.index as usize) <= state.log.len() {
                            state.log[(entry.index - 1) as usize] = entry;
                        } else {
                            state.log.push(entry);
                        }
                    }
                    let new_commit = leader_commit.min(state.log.len() as LogIndex);
                    state.commit_index = new_commit;
                    self.apply_committed(&mut state);
                    (state.current_term, state.commit_index)
                };
                let _ = self.commit_watch_tx.send(commit_index);
                self.reset_election.notify_one();

                Ok(AppendEntriesResponse {
                    term,
                    success: true,
                    conflict_index: None,
                    conflict_term: None,
                })
            }
        }
    }
}

fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    use rand::Rng;
    let lo = min.as_millis().max(1) as u64;
    let hi = max.as_millis().max(lo) as u64;
    let millis = rand::rng().random_range(lo..=hi);
    Duration::from_millis(millis)
}

#[async_trait]
impl RpcHandler for RaftNode {
    async fn handle_request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        // Decide what to do from a read-only snapshot; nothing here is
        // mutated until the corresponding persist below has completed, so a
        // storage failure can't leave `currentTerm`/`votedFor` diverged from
        // disk.
        let (adopt_term, should_grant) = {
            let state = self.state.read();
            if req.term < state.current_term {
                return Ok(RequestVoteResponse {
                    term: state.current_term,
                    vote_granted: false,
                });
            }
            let adopt_term = if req.term > state.current_term {
                Some(req.term)
            } else {
                None
            };
            // A term advance resets the vote, so judge `can_vote` against
            // what `votedFor` will be once that reset is persisted, not its
            // current on-disk value.
            let effective_voted_for = if adopt_term.is_some() {
                None
            } else {
                state.voted_for.clone()
            };
            let our_last_index = state.log.last().map(|e| e.index).unwrap_or(0);
            let our_last_term = state.log.last().map(|e| e.term).unwrap_or(0);
            let log_ok = req.last_log_term > our_last_term
                || (req.last_log_term == our_last_term && req.last_log_index >= our_last_index);
            let can_vote = match &effective_voted_for {
                None => true,
                Some(id) => *id == req.candidate_id,
            };
            (adopt_term, can_vote && log_ok)
        };

        if let Some(new_term) = adopt_term {
            self.store.save_term(new_term).await?;
        }
        if should_grant {
            self.store
                .save_voted_for(Some(req.candidate_id.clone()))
                .await?;
        }

        let current_term = {
            let mut state = self.state.write();
            if let Some(new_term) = adopt_term {
                if new_term > state.current_term {
                    state.current_term = new_term;
                    state.voted_for = None;
                    state.role = Role::Follower;
                }
            }
            if should_grant
                && (state.voted_for.is_none() || state.voted_for.as_ref() == Some(&req.candidate_id))
            {
                state.voted_for = Some(req.candidate_id.clone());
            }
            state.current_term
        };

        if should_grant {
            self.reset_election.notify_one();
        }

        Ok(RequestVoteResponse {
            term: current_term,
            vote_granted: should_grant,
        })
    }

    async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.handle_append_entries_inner(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::GitStateMachine;
    use crate::storage::MemoryStore;
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use std::time::Duration as StdDuration;

    fn fast_timing() -> TimingConfig {
        TimingConfig {
            election_timeout_min: StdDuration::from_millis(40),
            election_timeout_max: StdDuration::from_millis(80),
            heartbeat_interval: StdDuration::from_millis(15),
            rpc_timeout: StdDuration::from_millis(50),
            commit_timeout: StdDuration::from_secs(2),
        }
    }

    fn build_node(id: &str, peers: Vec<&str>, network: Arc<MemoryNetwork>) -> Arc<RaftNode> {
        let node_id = NodeId::new(id);
        let peer_ids: Vec<NodeId> = peers.into_iter().map(NodeId::new).collect();
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let sm: Arc<dyn StateMachine> = Arc::new(GitStateMachine::new());
        let transport: Arc<dyn Transport> =
            Arc::new(MemoryTransport::new(network, fast_timing().rpc_timeout));
        RaftNode::new(node_id, peer_ids, store, sm, transport, fast_timing())
    }

    async fn elect_leader(nodes: &[Arc<RaftNode>]) -> Arc<RaftNode> {
        for _ in 0..200 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            for node in nodes {
                if node.status().role == Role::Leader {
                    return node.clone();
                }
            }
        }
        panic!("no leader elected in time");
    }

    #[tokio::test]
    async fn three_node_cluster_elects_a_leader() {
        let network = MemoryNetwork::new();
        let nodes = vec![
            build_node("n1", vec!["n2", "n3"], network.clone()),
            build_node("n2", vec!["n1", "n3"], network.clone()),
            build_node("n3", vec!["n1", "n2"], network.clone()),
        ];
        for node in &nodes {
            let (tx, _rx) = mpsc::unbounded_channel();
            node.start(tx).await.unwrap();
        }

        let leader = elect_leader(&nodes).await;
        assert!(leader.status().term >= 1);

        let followers: Vec<_> = nodes
            .iter()
            .filter(|n| n.id() != leader.id())
            .collect();
        assert_eq!(followers.len(), 2);
        for f in followers {
            assert_eq!(f.status().role, Role::Follower);
        }
    }

    #[tokio::test]
    async fn committed_write_replicates_to_all_nodes() {
        let network = MemoryNetwork::new();
        let nodes = vec![
            build_node("n1", vec!["n2", "n3"], network.clone()),
            build_node("n2", vec!["n1", "n3"], network.clone()),
            build_node("n3", vec!["n1", "n2"], network.clone()),
        ];
        for node in &nodes {
            let (tx, _rx) = mpsc::unbounded_channel();
            node.start(tx).await.unwrap();
        }
        let leader = elect_leader(&nodes).await;

        let outcome = leader
            .client_write(Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            })
            .await
            .unwrap();
        assert!(outcome.is_applied());

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        for node in &nodes {
            assert_eq!(node.status().last_applied, 1);
        }
    }
}

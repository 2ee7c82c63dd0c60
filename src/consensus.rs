// Replicated Log Consensus
//
// Leader-based log replication over a fixed voter set known at bootstrap.
// Each replica is in one of three roles:
// - Follower: replicates entries from the leader
// - Candidate: requesting votes after an election timeout
// - Leader: orders submissions and drives replication
//
// Safety properties maintained here:
// - Election safety: at most one leader per term
// - Leader append-only: a leader never rewrites its own log
// - Log matching: equal (index, term) implies identical prefixes
// - Leader completeness: committed entries survive into later terms
// - State machine safety: apply order equals committed log order
//
// currentTerm, votedFor and the log are pushed through the `LogStore`
// persistence seam before any RPC response that depends on them is
// produced. The default store is in-memory; a durable implementation only
// has to honor the same call points.
//
// References:
// - Raft Paper: https://raft.github.io/raft.pdf

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::node::NodeId;
use crate::worker::{spawn_periodic, WorkerHandle};

/// Election epoch; at most one leader exists per term.
pub type Term = u64;

/// Position in the replicated log. The first entry has index 1.
pub type LogIndex = u64;

/// Replica role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Entry in the replicated log. The payload is opaque at this layer;
/// structured typing belongs to the apply callback's domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: String,
    pub payload: Vec<u8>,
}

/// Vote solicitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Log replication / heartbeat RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// On rejection the follower reports where the conflict starts so the
/// leader can back its next-index off past the whole conflicting term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub conflict_index: Option<LogIndex>,
    pub conflict_term: Option<Term>,
}

/// State that must survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
    pub last_applied: LogIndex,
}

/// Persistence seam. Implementations must make `persist` atomic per call:
/// a partial write has to be recoverable to the previous consistent state.
pub trait LogStore: Send + Sync {
    fn persist(&self, state: &PersistedState) -> Result<()>;
    fn load(&self) -> Result<Option<PersistedState>>;
}

/// Default store: bincode-encoded state held in memory. Keeps tests
/// hermetic; production embeds a durable store behind the same trait.
#[derive(Default)]
pub struct MemoryLogStore {
    buf: Mutex<Option<Vec<u8>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn persist(&self, state: &PersistedState) -> Result<()> {
        let encoded = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| ClusterError::Serialization(e.to_string()))?;
        *self.buf.lock() = Some(encoded);
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedState>> {
        match self.buf.lock().as_ref() {
            None => Ok(None),
            Some(bytes) => {
                let (state, _) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| ClusterError::Serialization(e.to_string()))?;
                Ok(Some(state))
            }
        }
    }
}

/// RPC seam between replicas.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, to: &NodeId, request: VoteRequest) -> Result<VoteResponse>;
    async fn append_entries(
        &self,
        to: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Consensus timing and batching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub leader_heartbeat_interval: Duration,
    /// Cadence of the driver loop; must be well under the heartbeat interval.
    pub tick_interval: Duration,
    pub rpc_timeout: Duration,
    /// How long `submit` waits for commit + local apply.
    pub submit_timeout: Duration,
    pub max_entries_per_append: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            leader_heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(15),
            rpc_timeout: Duration::from_millis(100),
            submit_timeout: Duration::from_secs(5),
            max_entries_per_append: 100,
        }
    }
}

/// Callback delivering committed entries, invoked in strict index order
/// exactly once per replica.
pub type ApplyFn = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Point-in-time replica status, mainly for operators and tests.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub role: Role,
    pub term: Term,
    pub leader_hint: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

struct ReplicaState {
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    role: Role,
    leader_hint: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    election_deadline: Instant,
    last_heartbeat_sent: Instant,
    votes: HashSet<NodeId>,
}

impl ReplicaState {
    fn last_log_index(&self) -> LogIndex {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    fn persisted(&self) -> PersistedState {
        PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.clone(),
            last_applied: self.last_applied,
        }
    }
}

/// One consensus replica.
pub struct ReplicatedLog {
    id: NodeId,
    voters: Vec<NodeId>,
    config: ConsensusConfig,
    /// Self-reference for the RPC tasks this replica spawns.
    weak_self: Weak<ReplicatedLog>,
    state: Mutex<ReplicaState>,
    /// Leader bookkeeping, only meaningful while `role == Leader`.
    progress: Mutex<LeaderProgress>,
    /// Serializes durable writes. Taken before the state lock, never
    /// while holding it.
    persist_gate: Mutex<()>,
    store: Arc<dyn LogStore>,
    transport: Arc<dyn RaftTransport>,
    apply_fn: Mutex<Option<ApplyFn>>,
    applied_tx: watch::Sender<LogIndex>,
    events: EventBus,
}

#[derive(Default)]
struct LeaderProgress {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
}

impl ReplicatedLog {
    pub fn new(
        id: NodeId,
        voters: Vec<NodeId>,
        config: ConsensusConfig,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn RaftTransport>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        if !voters.contains(&id) {
            return Err(ClusterError::InvalidArgument(format!(
                "replica {} is not in the voter set",
                id
            )));
        }

        let recovered = store.load()?;
        let (current_term, voted_for, log, last_applied) = match recovered {
            Some(p) => (p.current_term, p.voted_for, p.log, p.last_applied),
            None => (0, None, Vec::new(), 0),
        };

        let (applied_tx, _) = watch::channel(last_applied);
        let now = Instant::now();
        let election_deadline = now + config.random_election_timeout();
        let node = Arc::new_cyclic(|weak| Self {
            id,
            voters,
            weak_self: weak.clone(),
            state: Mutex::new(ReplicaState {
                current_term,
                voted_for,
                log,
                role: Role::Follower,
                leader_hint: None,
                // Recovered entries below last_applied were already
                // delivered before the restart.
                commit_index: last_applied,
                last_applied,
                election_deadline,
                last_heartbeat_sent: now,
                votes: HashSet::new(),
            }),
            progress: Mutex::new(LeaderProgress::default()),
            persist_gate: Mutex::new(()),
            store,
            transport,
            apply_fn: Mutex::new(None),
            applied_tx,
            events,
            config,
        });
        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn set_apply_callback(&self, callback: ApplyFn) {
        *self.apply_fn.lock() = Some(callback);
    }

    pub fn status(&self) -> ReplicaStatus {
        let s = self.state.lock();
        ReplicaStatus {
            role: s.role,
            term: s.current_term,
            leader_hint: s.leader_hint.clone(),
            commit_index: s.commit_index,
            last_applied: s.last_applied,
            last_log_index: s.last_log_index(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    /// Full log copy, for log-matching assertions in tests and audits.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().log.clone()
    }

    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    fn peers(&self) -> Vec<NodeId> {
        self.voters
            .iter()
            .filter(|v| **v != self.id)
            .cloned()
            .collect()
    }

    /// Persist current term/vote/log. Serialized on its own gate so durable
    /// writes never happen under the state lock.
    fn persist(&self) -> Result<()> {
        let _gate = self.persist_gate.lock();
        let snapshot = self.state.lock().persisted();
        self.store.persist(&snapshot)
    }

    /// Submit a command for replication. Only the leader accepts; followers
    /// answer with a redirect hint. Returns once the entry is committed and
    /// applied locally.
    pub async fn submit(
        &self,
        command: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<LogIndex> {
        let (index, term) = {
            let mut s = self.state.lock();
            if s.role != Role::Leader {
                return Err(ClusterError::NotLeader {
                    hint: s.leader_hint.clone(),
                });
            }
            let index = s.last_log_index() + 1;
            let term = s.current_term;
            let entry = LogEntry {
                index,
                term,
                command: command.into(),
                payload,
            };
            s.log.push(entry);
            (index, term)
        };
        self.persist()?;
        self.advance_leader_commit();
        self.replicate_now();

        let mut applied = self.applied_tx.subscribe();
        let deadline = self.config.submit_timeout;
        tokio::time::timeout(deadline, applied.wait_for(|v| *v >= index))
            .await
            .map_err(|_| {
                ClusterError::Timeout(format!(
                    "entry {} not committed within {:?}",
                    index, deadline
                ))
            })?
            .map_err(|_| ClusterError::Internal("replica shut down".into()))?;

        // Losing leadership can truncate an uncommitted entry; report that
        // as a failed submit rather than success at a recycled index.
        let s = self.state.lock();
        match s.entry(index) {
            Some(e) if e.term == term && s.commit_index >= index => {
                debug!(index = e.index, "submit committed");
                Ok(index)
            }
            _ => Err(ClusterError::NotLeader {
                hint: s.leader_hint.clone(),
            }),
        }
    }

    /// Driver loop body: election timer, leader heartbeats, apply.
    pub async fn tick(&self) {
        enum Action {
            Idle,
            Election,
            Heartbeat(Vec<(NodeId, AppendEntriesRequest)>),
        }

        let now = Instant::now();
        let action = {
            let mut s = self.state.lock();
            match s.role {
                Role::Leader => {
                    if now.duration_since(s.last_heartbeat_sent)
                        >= self.config.leader_heartbeat_interval
                    {
                        s.last_heartbeat_sent = now;
                        let batches = self.build_append_batches(&s);
                        Action::Heartbeat(batches)
                    } else {
                        Action::Idle
                    }
                }
                Role::Follower | Role::Candidate => {
                    if now >= s.election_deadline {
                        Action::Election
                    } else {
                        Action::Idle
                    }
                }
            }
        };

        match action {
            Action::Idle => {}
            Action::Election => self.start_election(),
            Action::Heartbeat(batches) => self.send_append_batches(batches),
        }
        self.apply_committed();
    }

    /// Spawn the driver worker for this replica.
    pub fn start(&self) -> WorkerHandle {
        let weak = self.weak_self.clone();
        spawn_periodic("consensus-tick", self.config.tick_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(node) = weak.upgrade() {
                    node.tick().await;
                }
            }
        })
    }

    fn start_election(&self) {
        let request = {
            let mut s = self.state.lock();
            s.current_term += 1;
            s.voted_for = Some(self.id.clone());
            s.role = Role::Candidate;
            s.leader_hint = None;
            s.votes.clear();
            s.votes.insert(self.id.clone());
            s.election_deadline = Instant::now() + self.config.random_election_timeout();
            debug!(node = %self.id, term = s.current_term, "election started");
            VoteRequest {
                term: s.current_term,
                candidate_id: self.id.clone(),
                last_log_index: s.last_log_index(),
                last_log_term: s.last_log_term(),
            }
        };
        if self.persist().is_err() {
            warn!(node = %self.id, "persist failed during election, standing down");
            return;
        }

        // Single-voter cluster: the self vote is already a majority.
        if self.state.lock().votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        for peer in self.peers() {
            let node = Arc::clone(&node);
            let request = request.clone();
            tokio::spawn(async move {
                let send = node.transport.request_vote(&peer, request);
                match tokio::time::timeout(node.config.rpc_timeout, send).await {
                    Ok(Ok(response)) => node.handle_vote_response(&peer, response),
                    Ok(Err(e)) => debug!(node = %node.id, peer = %peer, error = %e, "vote rpc failed"),
                    Err(_) => debug!(node = %node.id, peer = %peer, "vote rpc timed out"),
                }
            });
        }
    }

    /// RequestVote receiver side. The vote is granted iff the candidate's
    /// term is current, we have not voted for anyone else this term, and the
    /// candidate's log is at least as up-to-date as ours.
    pub fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let (response, changed) = {
            let mut s = self.state.lock();
            let mut changed = false;
            if request.term > s.current_term {
                Self::step_down(&mut s, request.term);
                changed = true;
            }

            let mut granted = false;
            if request.term >= s.current_term {
                let can_vote = s.voted_for.is_none()
                    || s.voted_for.as_ref() == Some(&request.candidate_id);
                let up_to_date = (request.last_log_term, request.last_log_index)
                    >= (s.last_log_term(), s.last_log_index());
                if can_vote && up_to_date {
                    s.voted_for = Some(request.candidate_id.clone());
                    s.election_deadline =
                        Instant::now() + self.config.random_election_timeout();
                    granted = true;
                    changed = true;
                }
            }
            (
                VoteResponse {
                    term: s.current_term,
                    vote_granted: granted,
                },
                changed,
            )
        };
        if changed {
            self.persist()?;
        }
        Ok(response)
    }

    fn handle_vote_response(&self, from: &NodeId, response: VoteResponse) {
        let won = {
            let mut s = self.state.lock();
            if response.term > s.current_term {
                Self::step_down(&mut s, response.term);
                drop(s);
                let _ = self.persist();
                return;
            }
            if s.role != Role::Candidate || response.term != s.current_term {
                return;
            }
            if response.vote_granted {
                s.votes.insert(from.clone());
            }
            s.votes.len() >= self.quorum()
        };
        if won {
            self.become_leader();
        }
    }

    fn become_leader(&self) {
        let (term, batches) = {
            let mut s = self.state.lock();
            if s.role == Role::Leader {
                return;
            }
            s.role = Role::Leader;
            s.leader_hint = Some(self.id.clone());
            s.last_heartbeat_sent = Instant::now();

            let mut progress = self.progress.lock();
            progress.next_index.clear();
            progress.match_index.clear();
            let next = s.last_log_index() + 1;
            for peer in self.peers() {
                progress.next_index.insert(peer.clone(), next);
                progress.match_index.insert(peer, 0);
            }
            drop(progress);
            (s.current_term, self.build_append_batches(&s))
        };

        info!(node = %self.id, term, "became leader");
        self.events.publish(ClusterEvent::LeaderElected {
            node: self.id.clone(),
            term,
        });
        self.send_append_batches(batches);
        self.advance_leader_commit();
    }

    /// AppendEntries receiver side. Resets the election timer for any valid
    /// leader of the current term, reconciles log conflicts and advances the
    /// commit index.
    pub fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (response, changed) = {
            let mut s = self.state.lock();
            let mut changed = false;
            if request.term > s.current_term {
                Self::step_down(&mut s, request.term);
                changed = true;
            }

            let response = 'reply: {
                if request.term < s.current_term {
                    break 'reply AppendEntriesResponse {
                        term: s.current_term,
                        success: false,
                        conflict_index: None,
                        conflict_term: None,
                    };
                }

                if s.role == Role::Leader {
                    // Another leader in our own term breaks election safety;
                    // this replica cannot be trusted any further.
                    panic!(
                        "election safety violated: {} and {} both lead term {}",
                        self.id, request.leader_id, s.current_term
                    );
                }

                s.role = Role::Follower;
                s.leader_hint = Some(request.leader_id.clone());
                s.election_deadline = Instant::now() + self.config.random_election_timeout();

                // Consistency check on the entry preceding the batch.
                if request.prev_log_index > 0 {
                    match s.term_at(request.prev_log_index) {
                        None => {
                            // Log too short: back the leader off to our end.
                            break 'reply AppendEntriesResponse {
                                term: s.current_term,
                                success: false,
                                conflict_index: Some(s.last_log_index() + 1),
                                conflict_term: None,
                            };
                        }
                        Some(term) if term != request.prev_log_term => {
                            // Report the whole conflicting term for fast
                            // back-off.
                            let first_of_term = s
                                .log
                                .iter()
                                .find(|e| e.term == term)
                                .map(|e| e.index)
                                .unwrap_or(request.prev_log_index);
                            break 'reply AppendEntriesResponse {
                                term: s.current_term,
                                success: false,
                                conflict_index: Some(first_of_term),
                                conflict_term: Some(term),
                            };
                        }
                        Some(_) => {}
                    }
                }

                // Append, truncating only on a real conflict so stale RPCs
                // can never undo entries a newer call already appended.
                for entry in &request.entries {
                    match s.term_at(entry.index) {
                        Some(term) if term == entry.term => continue,
                        Some(_) => {
                            if entry.index <= s.commit_index {
                                panic!(
                                    "log matching violated: rewrite of committed index {} on {}",
                                    entry.index, self.id
                                );
                            }
                            s.log.truncate((entry.index - 1) as usize);
                            s.log.push(entry.clone());
                            changed = true;
                        }
                        None => {
                            s.log.push(entry.clone());
                            changed = true;
                        }
                    }
                }

                if request.leader_commit > s.commit_index {
                    s.commit_index = request.leader_commit.min(s.last_log_index());
                }

                AppendEntriesResponse {
                    term: s.current_term,
                    success: true,
                    conflict_index: None,
                    conflict_term: None,
                }
            };
            (response, changed)
        };
        if changed {
            self.persist()?;
        }
        Ok(response)
    }

    fn handle_append_entries_response(
        &self,
        peer: &NodeId,
        acked_index: LogIndex,
        response: AppendEntriesResponse,
    ) {
        {
            let mut s = self.state.lock();
            if response.term > s.current_term {
                Self::step_down(&mut s, response.term);
                drop(s);
                let _ = self.persist();
                return;
            }
            if s.role != Role::Leader || response.term != s.current_term {
                return;
            }

            let mut progress = self.progress.lock();
            if response.success {
                let next = progress.next_index.entry(peer.clone()).or_insert(1);
                if acked_index + 1 > *next {
                    *next = acked_index + 1;
                }
                let matched = progress.match_index.entry(peer.clone()).or_insert(0);
                if acked_index > *matched {
                    *matched = acked_index;
                }
            } else {
                // Back off past the follower's conflicting term when we hold
                // entries of that term ourselves, else jump to its hint.
                let fallback = progress
                    .next_index
                    .get(peer)
                    .copied()
                    .unwrap_or(1)
                    .saturating_sub(1)
                    .max(1);
                let next = match (response.conflict_term, response.conflict_index) {
                    (Some(term), Some(hint)) => s
                        .log
                        .iter()
                        .rev()
                        .find(|e| e.term == term)
                        .map(|e| e.index + 1)
                        .unwrap_or(hint),
                    (None, Some(hint)) => hint,
                    _ => fallback,
                };
                progress.next_index.insert(peer.clone(), next.max(1));
            }
        }
        self.advance_leader_commit();
    }

    /// Commit rule: an entry is committed once stored on a strict majority
    /// and at least one entry of the current term is on that majority.
    fn advance_leader_commit(&self) {
        let committed = {
            let mut s = self.state.lock();
            if s.role != Role::Leader {
                return;
            }
            let progress = self.progress.lock();
            let mut matches: Vec<LogIndex> = progress.match_index.values().copied().collect();
            drop(progress);
            matches.push(s.last_log_index());
            matches.sort_unstable_by(|a, b| b.cmp(a));

            let candidate = matches.get(self.quorum() - 1).copied().unwrap_or(0);
            if candidate > s.commit_index && s.term_at(candidate) == Some(s.current_term) {
                s.commit_index = candidate;
                Some((candidate, s.current_term))
            } else {
                None
            }
        };
        if let Some((index, term)) = committed {
            debug!(node = %self.id, index, term, "commit index advanced");
            self.events.publish(ClusterEvent::EntryCommitted { index, term });
        }
    }

    /// Kick replication immediately instead of waiting for the heartbeat.
    fn replicate_now(&self) {
        let batches = {
            let mut s = self.state.lock();
            if s.role != Role::Leader {
                return;
            }
            s.last_heartbeat_sent = Instant::now();
            self.build_append_batches(&s)
        };
        self.send_append_batches(batches);
    }

    fn build_append_batches(&self, s: &ReplicaState) -> Vec<(NodeId, AppendEntriesRequest)> {
        let progress = self.progress.lock();
        self.peers()
            .into_iter()
            .map(|peer| {
                let next = progress.next_index.get(&peer).copied().unwrap_or(1);
                let prev_log_index = next.saturating_sub(1);
                let prev_log_term = s.term_at(prev_log_index).unwrap_or(0);
                let from = (next.saturating_sub(1)) as usize;
                let to = (from + self.config.max_entries_per_append).min(s.log.len());
                let entries = if from < s.log.len() {
                    s.log[from..to].to_vec()
                } else {
                    Vec::new()
                };
                (
                    peer,
                    AppendEntriesRequest {
                        term: s.current_term,
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: s.commit_index,
                    },
                )
            })
            .collect()
    }

    fn send_append_batches(&self, batches: Vec<(NodeId, AppendEntriesRequest)>) {
        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        for (peer, request) in batches {
            let node = Arc::clone(&node);
            let acked_index = request.prev_log_index + request.entries.len() as u64;
            tokio::spawn(async move {
                let send = node.transport.append_entries(&peer, request);
                match tokio::time::timeout(node.config.rpc_timeout, send).await {
                    Ok(Ok(response)) => {
                        node.handle_append_entries_response(&peer, acked_index, response)
                    }
                    Ok(Err(e)) => {
                        debug!(node = %node.id, peer = %peer, error = %e, "append rpc failed")
                    }
                    Err(_) => debug!(node = %node.id, peer = %peer, "append rpc timed out"),
                }
            });
        }
    }

    /// Deliver committed entries in order. Runs only on the driver worker,
    /// which makes delivery exactly-once per replica; the callback is never
    /// invoked under the state lock.
    fn apply_committed(&self) {
        loop {
            let entry = {
                let s = self.state.lock();
                if s.last_applied >= s.commit_index {
                    break;
                }
                match s.entry(s.last_applied + 1) {
                    Some(e) => e.clone(),
                    None => {
                        panic!(
                            "state machine safety violated: commit index {} beyond log on {}",
                            s.commit_index, self.id
                        );
                    }
                }
            };

            let callback = self.apply_fn.lock().clone();
            if let Some(callback) = callback {
                callback(&entry);
            }

            {
                let mut s = self.state.lock();
                if entry.index != s.last_applied + 1 {
                    panic!(
                        "state machine safety violated: applied {} after {} on {}",
                        entry.index, s.last_applied, self.id
                    );
                }
                s.last_applied = entry.index;
            }
            let _ = self.applied_tx.send(entry.index);
            self.events
                .publish(ClusterEvent::EntryApplied { index: entry.index });
        }

        // Invariant: lastApplied <= commitIndex <= lastLogIndex.
        let s = self.state.lock();
        if !(s.last_applied <= s.commit_index && s.commit_index <= s.last_log_index()) {
            panic!(
                "log invariant violated on {}: applied {} commit {} last {}",
                self.id,
                s.last_applied,
                s.commit_index,
                s.last_log_index()
            );
        }
    }

    fn step_down(s: &mut ReplicaState, term: Term) {
        s.current_term = term;
        s.voted_for = None;
        s.role = Role::Follower;
        s.votes.clear();
    }
}

impl ConsensusConfig {
    fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max.max(min)))
    }
}

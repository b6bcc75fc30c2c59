//! The Role Engine, replicated log, and RPC client side of the node.
//!
//! Follows the teacher's `Arc<Mutex<...>>` shape but splits the single
//! global lock's *scope* more carefully: the critical section never spans
//! a network I/O call (§5). Per-peer replication and vote requests are
//! independent tasks that read a shared "leader epoch" counter and exit as
//! soon as it no longer matches the epoch they were spawned under — the
//! epoch-token design called out in §9 as the replacement for the
//! source's ad-hoc thread-per-peer loops that never learned about a role
//! change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::booking::BookingCommand;
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::messages::{
    read_message, write_message, AppendEntriesReply, AppendEntriesRequest, ClientReply,
    ClientRequest, RaftMessage, StatusReply, StatusRequest, VoteReply, VoteRequest,
};
use crate::persist::PersistentStore;
use crate::state::{Entry, LeaderState, NodeId, PersistentState, Peer, Role, VolatileState};

/// Per-RPC timeout. A timeout is indistinguishable from loss (§4.6) and is
/// always treated as "no response", never as implicit success.
const RPC_TIMEOUT: Duration = Duration::from_millis(2_000);
/// Entries are batched per `AppendEntries` rather than sent one at a time,
/// bounded so a large backlog doesn't produce one enormous RPC.
const MAX_ENTRIES_PER_RPC: usize = 64;

struct Inner {
    persistent: PersistentState,
    volatile: VolatileState,
    role: Role,
    leader_state: Option<LeaderState>,
    leader_hint: Option<NodeId>,
    election_deadline: Instant,
}

pub struct RaftNode {
    config: RaftConfig,
    store: PersistentStore,
    inner: Mutex<Inner>,
    /// Bumped every time the node becomes leader or steps down from
    /// leadership. Replication and vote-request tasks compare their
    /// captured epoch against the current one and exit on mismatch.
    leader_epoch: AtomicU64,
    /// Woken whenever a new entry is appended to the log, so per-peer
    /// replication tasks don't wait out a full heartbeat interval to
    /// notice a freshly proposed entry.
    replicate_notify: Notify,
    apply_notify: Notify,
    room: Mutex<crate::booking::RoomState>,
}

impl RaftNode {
    pub async fn new(config: RaftConfig) -> Result<Arc<Self>, RaftError> {
        config.validate().map_err(RaftError::Malformed)?;
        let store = PersistentStore::new(config.state_path.clone());
        let persistent = store.load().await?;
        info!(
            "[{}] loaded persistent state: term={} voted_for={:?} log_len={}",
            config.node_id,
            persistent.current_term,
            persistent.voted_for,
            persistent.log.len()
        );

        let node = Arc::new(RaftNode {
            inner: Mutex::new(Inner {
                persistent,
                volatile: VolatileState::default(),
                role: Role::Follower,
                leader_state: None,
                leader_hint: None,
                election_deadline: Instant::now(),
            }),
            leader_epoch: AtomicU64::new(0),
            replicate_notify: Notify::new(),
            apply_notify: Notify::new(),
            room: Mutex::new(crate::booking::RoomState::new()),
            store,
            config,
        });

        {
            let mut inner = node.inner.lock().await;
            inner.election_deadline = node.random_election_deadline();
        }

        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Spawns the election timer task and the apply task. The acceptor
    /// loop lives in the `raft-node` binary, which owns the listener;
    /// per-peer tasks are spawned on demand when this node becomes a
    /// candidate or a leader.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let election_node = Arc::clone(self);
        tokio::spawn(async move { election_node.run_election_timer().await });

        let apply_node = Arc::clone(self);
        tokio::spawn(async move { apply_node.run_apply_loop().await });
    }

    fn random_election_deadline(&self) -> Instant {
        let ms = rand::thread_rng()
            .gen_range(self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms);
        Instant::now() + Duration::from_millis(ms)
    }

    // ---------------------------------------------------------------
    // Election timer
    // ---------------------------------------------------------------

    async fn run_election_timer(self: Arc<Self>) {
        loop {
            // While leading, election_deadline is not otherwise touched
            // (it's last set by the follower/candidate transition that
            // preceded the win), so it must be refreshed here every
            // iteration or sleep_until would resolve instantly forever.
            let deadline = {
                let mut inner = self.inner.lock().await;
                if inner.role == Role::Leader {
                    inner.election_deadline = self.random_election_deadline();
                }
                inner.election_deadline
            };
            tokio::time::sleep_until(deadline).await;

            let should_start = {
                let inner = self.inner.lock().await;
                inner.role != Role::Leader && Instant::now() >= inner.election_deadline
            };
            if should_start {
                self.clone().start_election().await;
            }
        }
    }

    // ---------------------------------------------------------------
    // Candidate: election
    // ---------------------------------------------------------------

    async fn start_election(self: Arc<Self>) {
        let (term, last_log_index, last_log_term, peers) = {
            let mut inner = self.inner.lock().await;
            inner.role = Role::Candidate;
            let term = inner.persistent.increment_term();
            inner.persistent.voted_for = Some(self.node_id());
            inner.election_deadline = self.random_election_deadline();
            let last_log_index = inner.persistent.log.last_index();
            let last_log_term = inner.persistent.log.last_term();

            if let Err(e) = self.store.save(&inner.persistent).await {
                self.abort_on_persistence_failure(format!("failed to persist candidacy for term {term}"), e);
            }

            (term, last_log_index, last_log_term, self.config.peers.clone())
        };

        info!("[{}] starting election for term {term}", self.node_id());

        let majority = self.config.majority();
        let votes = Arc::new(AtomicUsize::new(1)); // we voted for ourselves
        if votes.load(Ordering::SeqCst) >= majority {
            self.clone().become_leader(term).await;
            return;
        }

        for peer in peers {
            let node = Arc::clone(&self);
            let votes = Arc::clone(&votes);
            tokio::spawn(async move {
                node.request_vote_from_peer(peer, term, last_log_index, last_log_term, votes, majority)
                    .await;
            });
        }
    }

    async fn request_vote_from_peer(
        self: Arc<Self>,
        peer: Peer,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        votes: Arc<AtomicUsize>,
        majority: usize,
    ) {
        let request = RaftMessage::RequestVote(VoteRequest {
            term,
            candidate_id: self.node_id(),
            last_log_index,
            last_log_term,
        });

        let reply = match call_peer(&peer.addr(), &request).await {
            Ok(RaftMessage::RequestVoteReply(reply)) => reply,
            Ok(other) => {
                warn!("[{}] unexpected reply to RequestVote from {}: {other:?}", self.node_id(), peer.id);
                return;
            }
            Err(e) => {
                debug!("[{}] RequestVote to {} failed: {e}", self.node_id(), peer.id);
                return;
            }
        };

        // A candidate discards vote replies whose term doesn't match the
        // term of its candidacy (§5).
        let mut inner = self.inner.lock().await;
        if reply.term > inner.persistent.current_term {
            self.step_down(&mut inner, reply.term).await;
            return;
        }
        if inner.role != Role::Candidate || inner.persistent.current_term != term {
            return; // stale w.r.t. our own state; ignore
        }
        drop(inner);

        if reply.vote_granted {
            let count = votes.fetch_add(1, Ordering::SeqCst) + 1;
            info!("[{}] received vote from {} ({}/{})", self.node_id(), peer.id, count, majority);
            if count == majority {
                self.become_leader(term).await;
            }
        }
    }

    // ---------------------------------------------------------------
    // Leader
    // ---------------------------------------------------------------

    async fn become_leader(self: Arc<Self>, term: u64) {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.role == Role::Leader || inner.persistent.current_term != term {
                return; // already leader, or a newer term superseded this win
            }
            inner.role = Role::Leader;
            inner.leader_hint = Some(self.node_id());
            let last_index = inner.persistent.log.last_index();
            inner.leader_state = Some(LeaderState::reinitialize(&self.config.peers, last_index));
            self.leader_epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        info!("[{}] became leader for term {term}", self.node_id());

        for peer in self.config.peers.clone() {
            let node = Arc::clone(&self);
            tokio::spawn(async move { node.run_peer_replication(peer, epoch).await });
        }
    }

    /// One independent task per peer, alive for exactly one leadership
    /// epoch. Replaces the source's unconditional thread-per-peer loops,
    /// which kept running after a step-down because nothing told them to
    /// stop.
    async fn run_peer_replication(self: Arc<Self>, peer: Peer, epoch: u64) {
        loop {
            if self.leader_epoch.load(Ordering::SeqCst) != epoch {
                debug!("[{}] replication to {} stopping: epoch advanced", self.node_id(), peer.id);
                return;
            }

            let _ = tokio::time::timeout(
                Duration::from_millis(self.config.heartbeat_interval_ms),
                self.replicate_notify.notified(),
            )
            .await;

            if self.leader_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            let request = {
                let inner = self.inner.lock().await;
                if inner.role != Role::Leader {
                    return;
                }
                let leader_state = inner.leader_state.as_ref().expect("leader_state set while leader");
                let next_index = *leader_state.next_index.get(&peer.id).unwrap_or(&1);
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = inner.persistent.log.term_at(prev_log_index).unwrap_or(0);
                let mut entries: Vec<Entry> = inner.persistent.log.slice_from(next_index).to_vec();
                entries.truncate(MAX_ENTRIES_PER_RPC);
                AppendEntriesRequest {
                    term: inner.persistent.current_term,
                    leader_id: self.node_id(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: inner.volatile.commit_index,
                }
            };
            let sent_prev_index = request.prev_log_index;
            let sent_count = request.entries.len() as u64;
            let sent_term = request.term;

            let reply = match call_peer(&peer.addr(), &RaftMessage::AppendEntries(request)).await {
                Ok(RaftMessage::AppendEntriesReply(reply)) => reply,
                Ok(other) => {
                    warn!("[{}] unexpected reply to AppendEntries from {}: {other:?}", self.node_id(), peer.id);
                    continue;
                }
                Err(e) => {
                    debug!("[{}] AppendEntries to {} failed: {e}", self.node_id(), peer.id);
                    continue;
                }
            };

            let mut inner = self.inner.lock().await;
            if reply.term > inner.persistent.current_term {
                self.step_down(&mut inner, reply.term).await;
                return;
            }
            if inner.role != Role::Leader || inner.persistent.current_term != sent_term {
                return; // stepped down or moved on since we sent this RPC
            }

            let leader_state = inner.leader_state.as_mut().expect("leader_state set while leader");
            if reply.success {
                let new_match = (sent_prev_index + sent_count).max(reply.last_log_index);
                let cur_match = *leader_state.match_index.get(&peer.id).unwrap_or(&0);
                if new_match > cur_match {
                    leader_state.match_index.insert(peer.id, new_match);
                    leader_state.next_index.insert(peer.id, new_match + 1);
                }
                self.try_advance_commit_index(&mut inner);
            } else {
                // Log mismatch: decrement nextIndex and retry, never below
                // 1. The follower's reported last_log_index is used as a
                // hint to converge in fewer round trips when informative.
                let cur_next = *leader_state.next_index.get(&peer.id).unwrap_or(&1);
                let hinted = reply.last_log_index.saturating_add(1).max(1);
                let new_next = if hinted < cur_next { hinted } else { cur_next.saturating_sub(1).max(1) };
                leader_state.next_index.insert(peer.id, new_next);
            }
        }
    }

    /// §4.3: advance `commitIndex` to the largest `N` such that a majority
    /// of `matchIndex` values (counting self) are `>= N` and `log[N].term
    /// == currentTerm`. Never commits a prior-term entry by vote-counting
    /// alone.
    fn try_advance_commit_index(&self, inner: &mut Inner) {
        let leader_state = match inner.leader_state.as_ref() {
            Some(ls) => ls,
            None => return,
        };
        let last_index = inner.persistent.log.last_index();
        let majority = self.config.majority();
        let current_term = inner.persistent.current_term;

        let mut candidate = inner.volatile.commit_index;
        for n in (inner.volatile.commit_index + 1)..=last_index {
            if inner.persistent.log.term_at(n) != Some(current_term) {
                continue;
            }
            let mut acked = 1; // self
            for &matched in leader_state.match_index.values() {
                if matched >= n {
                    acked += 1;
                }
            }
            if acked >= majority {
                candidate = n;
            }
        }
        if candidate > inner.volatile.commit_index {
            inner.volatile.commit_index = candidate;
            info!("[{}] leader advanced commit_index to {candidate}", self.node_id());
            self.apply_notify.notify_waiters();
        }
    }

    // ---------------------------------------------------------------
    // Step down (§4.1's step-down rule)
    // ---------------------------------------------------------------

    async fn step_down(&self, inner: &mut Inner, new_term: u64) {
        let was_leader = inner.role == Role::Leader;
        inner.persistent.set_term(new_term);
        inner.role = Role::Follower;
        inner.leader_state = None;
        inner.election_deadline = self.random_election_deadline();
        if was_leader {
            self.leader_epoch.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(e) = self.store.save(&inner.persistent).await {
            self.abort_on_persistence_failure(format!("failed to persist step-down to term {new_term}"), e);
        }
        info!("[{}] stepped down, adopted term {new_term}", self.node_id());
    }

    /// Persistence failures are unrecoverable (§7): the in-memory state has
    /// already diverged from what's durable, so the node halts rather than
    /// risk serving RPCs (or granting votes, or acking commands) on the
    /// strength of a term/vote/log entry that a restart would forget.
    fn abort_on_persistence_failure(&self, context: String, err: RaftError) -> ! {
        error!("[{}] FATAL: {context}: {err}", self.node_id());
        std::process::exit(1);
    }

    // ---------------------------------------------------------------
    // RPC handlers
    // ---------------------------------------------------------------

    pub async fn handle_message(self: &Arc<Self>, message: RaftMessage) -> RaftMessage {
        match message {
            RaftMessage::RequestVote(req) => RaftMessage::RequestVoteReply(self.handle_request_vote(req).await),
            RaftMessage::AppendEntries(req) => {
                RaftMessage::AppendEntriesReply(self.handle_append_entries(req).await)
            }
            RaftMessage::ClientRequest(req) => RaftMessage::ClientReply(self.handle_client_request(req).await),
            RaftMessage::StatusRequest(req) => RaftMessage::StatusReply(self.handle_status_request(req).await),
            other => {
                warn!("[{}] received a reply-shaped message on the server side: {other:?}", self.node_id());
                RaftMessage::ClientReply(ClientReply::NotLeader { leader_hint: None })
            }
        }
    }

    async fn handle_request_vote(&self, req: VoteRequest) -> VoteReply {
        let mut inner = self.inner.lock().await;
        let current_term = inner.persistent.current_term;

        if req.term < current_term {
            return VoteReply { term: current_term, vote_granted: false };
        }
        if req.term > current_term {
            self.step_down(&mut inner, req.term).await;
        }

        let already_voted_elsewhere =
            inner.persistent.voted_for.is_some() && inner.persistent.voted_for != Some(req.candidate_id);
        let our_last_term = inner.persistent.log.last_term();
        let our_last_index = inner.persistent.log.last_index();
        let candidate_up_to_date = req.last_log_term > our_last_term
            || (req.last_log_term == our_last_term && req.last_log_index >= our_last_index);

        if already_voted_elsewhere || !candidate_up_to_date {
            debug!(
                "[{}] denying vote to {} (already_voted_elsewhere={already_voted_elsewhere} up_to_date={candidate_up_to_date})",
                self.node_id(),
                req.candidate_id
            );
            return VoteReply { term: inner.persistent.current_term, vote_granted: false };
        }

        inner.persistent.voted_for = Some(req.candidate_id);
        inner.election_deadline = self.random_election_deadline();
        let term = inner.persistent.current_term;

        if let Err(e) = self.store.save(&inner.persistent).await {
            self.abort_on_persistence_failure(format!("failed to persist vote for {}", req.candidate_id), e);
        }

        info!("[{}] granted vote to {} for term {term}", self.node_id(), req.candidate_id);
        VoteReply { term, vote_granted: true }
    }

    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesReply {
        let mut inner = self.inner.lock().await;
        let current_term = inner.persistent.current_term;

        if req.term < current_term {
            return AppendEntriesReply {
                term: current_term,
                success: false,
                last_log_index: inner.persistent.log.last_index(),
            };
        }
        if req.term > current_term {
            self.step_down(&mut inner, req.term).await;
        }

        inner.role = Role::Follower;
        inner.leader_hint = Some(req.leader_id);
        inner.election_deadline = self.random_election_deadline();

        if req.prev_log_index > 0 {
            let matches = inner.persistent.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
            if !matches {
                return AppendEntriesReply {
                    term: inner.persistent.current_term,
                    success: false,
                    last_log_index: inner.persistent.log.last_index(),
                };
            }
        }

        // Only truncate from the first actually-conflicting index onward,
        // never unconditionally from prev_log_index + 1 (§9).
        let mut insert_at = req.prev_log_index + 1;
        let mut changed = false;
        for entry in &req.entries {
            match inner.persistent.log.term_at(insert_at) {
                Some(existing_term) if existing_term == entry.term => {
                    // identical entry already present; idempotent no-op
                }
                Some(_) => {
                    inner.persistent.log.truncate_to(insert_at - 1);
                    inner.persistent.log.append(entry.clone());
                    changed = true;
                }
                None => {
                    inner.persistent.log.append(entry.clone());
                    changed = true;
                }
            }
            insert_at += 1;
        }
        let last_new_index = insert_at - 1;

        if req.leader_commit > inner.volatile.commit_index {
            inner.volatile.commit_index = req.leader_commit.min(last_new_index);
            self.apply_notify.notify_waiters();
        }

        let term = inner.persistent.current_term;
        let last_log_index = inner.persistent.log.last_index();

        if changed {
            if let Err(e) = self.store.save(&inner.persistent).await {
                self.abort_on_persistence_failure("failed to persist replicated entries".to_string(), e);
            }
        }

        AppendEntriesReply { term, success: true, last_log_index }
    }

    async fn handle_client_request(self: &Arc<Self>, req: ClientRequest) -> ClientReply {
        match self.propose(req.command).await {
            Ok(index) => ClientReply::Ok { index },
            Err(RaftError::NotLeader { hint }) => ClientReply::NotLeader { leader_hint: hint },
            Err(e) => {
                error!("[{}] client request failed: {e}", self.node_id());
                ClientReply::NotLeader { leader_hint: None }
            }
        }
    }

    async fn handle_status_request(&self, req: StatusRequest) -> StatusReply {
        let room = self.room.lock().await;
        let inner = self.inner.lock().await;
        let rooms = match req.room_id {
            Some(id) => vec![(id, room.booked_slots(id))],
            None => Vec::new(),
        };
        StatusReply { rooms, last_applied: inner.volatile.last_applied }
    }

    /// Appends `command` to the leader's log and returns its index once
    /// durable (not once committed — the client contract in §6 only
    /// promises durability on a majority eventually, not synchronous
    /// commit). Rejects with [`RaftError::NotLeader`] on any other node.
    pub async fn propose(self: &Arc<Self>, command: Vec<u8>) -> Result<u64, RaftError> {
        let index = {
            let mut inner = self.inner.lock().await;
            if inner.role != Role::Leader {
                return Err(RaftError::NotLeader { hint: inner.leader_hint });
            }
            let term = inner.persistent.current_term;
            let index = inner.persistent.log.append(Entry { term, data: command });
            let leader_state = inner.leader_state.as_mut().expect("leader_state set while leader");
            leader_state.match_index.insert(self.node_id(), index);

            if let Err(e) = self.store.save(&inner.persistent).await {
                self.abort_on_persistence_failure(format!("failed to persist proposed entry at index {index}"), e);
            }

            index
        };

        self.replicate_notify.notify_waiters();
        Ok(index)
    }

    pub async fn propose_booking(self: &Arc<Self>, command: BookingCommand) -> Result<u64, RaftError> {
        self.propose(command.to_bytes()).await
    }

    // ---------------------------------------------------------------
    // State machine adapter
    // ---------------------------------------------------------------

    async fn run_apply_loop(self: Arc<Self>) {
        loop {
            let _ = tokio::time::timeout(
                Duration::from_millis(self.config.apply_interval_ms),
                self.apply_notify.notified(),
            )
            .await;

            loop {
                let next = {
                    let inner = self.inner.lock().await;
                    if inner.volatile.last_applied >= inner.volatile.commit_index {
                        break;
                    }
                    inner.volatile.last_applied + 1
                };

                let entry = {
                    let inner = self.inner.lock().await;
                    inner.persistent.log.get(next).cloned()
                };

                if let Some(entry) = entry {
                    match BookingCommand::from_bytes(&entry.data) {
                        Ok(cmd) => {
                            let outcome = self.room.lock().await.apply(&cmd);
                            debug!("[{}] applied index {next}: {cmd:?} -> {outcome:?}", self.node_id());
                        }
                        Err(e) => {
                            warn!("[{}] could not decode command at index {next}: {e}", self.node_id());
                        }
                    }
                }

                let mut inner = self.inner.lock().await;
                inner.volatile.last_applied = next;
            }
        }
    }

    // ---------------------------------------------------------------
    // Introspection, mostly for tests and the CLI
    // ---------------------------------------------------------------

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.role == Role::Leader
    }

    pub async fn role(&self) -> Role {
        self.inner.lock().await.role
    }

    pub async fn current_term(&self) -> u64 {
        self.inner.lock().await.persistent.current_term
    }

    pub async fn leader_hint(&self) -> Option<NodeId> {
        self.inner.lock().await.leader_hint
    }

    pub async fn commit_index(&self) -> u64 {
        self.inner.lock().await.volatile.commit_index
    }

    pub async fn last_applied(&self) -> u64 {
        self.inner.lock().await.volatile.last_applied
    }

    pub async fn log_len(&self) -> u64 {
        self.inner.lock().await.persistent.log.last_index()
    }

    pub async fn log_entries(&self) -> Vec<Entry> {
        self.inner.lock().await.persistent.log.iter().cloned().collect()
    }

    pub async fn match_index_snapshot(&self) -> HashMap<NodeId, u64> {
        self.inner
            .lock()
            .await
            .leader_state
            .as_ref()
            .map(|ls| ls.match_index.clone())
            .unwrap_or_default()
    }

    pub async fn booked_slots(&self, room_id: crate::booking::RoomId) -> Vec<crate::booking::Slot> {
        self.room.lock().await.booked_slots(room_id)
    }

    /// Forces an immediate election, bypassing the timer. Used by tests
    /// that need a deterministic leader rather than waiting out a random
    /// timeout.
    pub async fn force_election(self: &Arc<Self>) {
        self.clone().start_election().await;
    }
}

/// Connects to `addr`, sends `message`, and returns the single reply,
/// bounded by [`RPC_TIMEOUT`]. One message per connection, matching §4.6.
pub async fn call_peer(addr: &str, message: &RaftMessage) -> Result<RaftMessage, RaftError> {
    tokio::time::timeout(RPC_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_message(&mut stream, message).await?;
        read_message(&mut stream).await
    })
    .await
    .map_err(|_| RaftError::Transport(std::io::Error::new(std::io::ErrorKind::TimedOut, "rpc timed out")))?
}

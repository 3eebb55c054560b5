//! Orchestrator (C11, spec §4.9).
//!
//! Owns role/term/state, serializes message handling over the
//! teacher-style coarse `Mutex<ServerState>`, dispatches to the election,
//! replication, snapshot-transfer, membership and notification modules,
//! and fires user callbacks. One background thread drives election and
//! heartbeat timers and applies peer responses as they arrive, mirroring
//! the teacher's single state-owning loop plus one thread per peer.

pub mod peer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::RaftConfig;
use crate::election::{
    grant_pre_vote, grant_real_vote, may_start_election, quorum_size, PreVoteInput, RealVoteInput, Role,
    VoteTally,
};
use crate::error::{Error, Result};
use crate::forwarding::ForwardPool;
use crate::log_entry::{LogEntry, ValueType};
use crate::membership::{
    advance_leadership_transfer, pick_transfer_target, CatchUpOutcome, CatchUpTracker, MembershipChange,
    TransferState,
};
use crate::message::codec::WireCodec;
use crate::message::notification::CustomNotification;
use crate::message::{ReqMsg, ReqPayload, RespMsg, RespPayload};
use crate::notification::{decide_request_action, needs_out_of_log_range_warning, NotificationAction};
use crate::replication::{
    clamp_adjusted_commit_index, follower_apply_append_entries, follower_commit_index, plan_append_entries,
    quorum_commit_index,
};
use crate::server::peer::{PeerHandle, PeerRecord, PeerResult};
use crate::snapshot::{SnapshotDescriptor, SnapshotSyncReq};
use crate::snapshot_transfer::{follower_apply_snapshot_chunk, should_create_snapshot};
use crate::srv_config::{ClusterConfig, ClusterServer};
use crate::state::DurableState;
use crate::traits::{LogStore, RpcClientFactory, StateMachine, StateManager};
use crate::types::{LogIndex, ServerId, Term};

/// Events a consumer may subscribe to via [`RaftServer::set_callback`].
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    BecomeLeader { term: Term },
    BecomeFollower { term: Term },
    BecomeResigned,
    OutOfLogRangeWarning { start_idx_of_leader: LogIndex },
    ConfigChange,
}

pub type Callback = dyn Fn(CallbackEvent) + Send + Sync;

struct ServerState {
    role: Role,
    current_term: Term,
    voted_for: Option<ServerId>,
    config: ClusterConfig,
    commit_index: LogIndex,
    leader_id: Option<ServerId>,
    out_of_log_range: bool,
    last_leader_contact: Instant,
    election_deadline: Instant,
    config_change_in_flight: bool,
    vote_tally: Option<VoteTally>,
    pre_vote_tally: Option<(Term, VoteTally)>,
    catch_up: Option<CatchUpTracker>,
}

/// The embeddable Raft engine (spec §1).
pub struct RaftServer {
    id: ServerId,
    config: RaftConfig,
    state: Mutex<ServerState>,
    commit_cv: Condvar,
    log: Arc<dyn LogStore>,
    state_machine: Arc<dyn StateMachine>,
    state_manager: Arc<dyn StateManager>,
    client_factory: Arc<dyn RpcClientFactory>,
    peers: Mutex<HashMap<ServerId, PeerHandle>>,
    peer_result_tx: Sender<PeerResult>,
    peer_result_rx: Mutex<Receiver<PeerResult>>,
    forward_pool: ForwardPool,
    callback: Mutex<Option<Box<Callback>>>,
    background: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    /// Blocking client calls parked here, woken once their index commits.
    pending: Mutex<HashMap<LogIndex, Sender<Result<Vec<u8>>>>>,
}

impl RaftServer {
    /// Constructs and starts the engine: loads durable state, spins up
    /// one thread per non-learner-excluded peer, and starts the
    /// background election/heartbeat loop. Matches the teacher's
    /// `Server::new` + implicit `start_server` split, folded into one
    /// entry point.
    pub fn start(
        id: ServerId,
        config: RaftConfig,
        log: Arc<dyn LogStore>,
        state_machine: Arc<dyn StateMachine>,
        state_manager: Arc<dyn StateManager>,
        client_factory: Arc<dyn RpcClientFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let durable = state_manager.read_state()?;
        let cluster_config = state_manager.load_config()?;
        let (peer_result_tx, peer_result_rx) = channel();

        let now = Instant::now();
        let server = Arc::new(RaftServer {
            id,
            forward_pool: ForwardPool::new(
                client_factory.clone(),
                config.auto_forwarding_max_connections as usize,
                config.auto_forwarding_req_timeout_ms,
            ),
            state: Mutex::new(ServerState {
                role: Role::Follower,
                current_term: durable.current_term,
                voted_for: durable.voted_for,
                config: cluster_config,
                commit_index: 0,
                leader_id: None,
                out_of_log_range: false,
                last_leader_contact: now,
                election_deadline: now + random_election_timeout(&config),
                config_change_in_flight: false,
                vote_tally: None,
                pre_vote_tally: None,
                catch_up: None,
            }),
            commit_cv: Condvar::new(),
            log,
            state_machine,
            state_manager,
            client_factory,
            peers: Mutex::new(HashMap::new()),
            peer_result_tx,
            peer_result_rx: Mutex::new(peer_result_rx),
            callback: Mutex::new(None),
            background: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(HashMap::new()),
            config,
        });

        server.rebuild_peers()?;

        let worker_server = server.clone();
        let handle = thread::spawn(move || worker_server.run_loop());
        *server.background.lock().unwrap() = Some(handle);

        Ok(server)
    }

    pub fn set_callback(&self, cb: impl Fn(CallbackEvent) + Send + Sync + 'static) {
        *self.callback.lock().unwrap() = Some(Box::new(cb));
    }

    fn fire(&self, event: CallbackEvent) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(event);
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().role == Role::Leader
    }

    pub fn current_leader(&self) -> Option<ServerId> {
        self.state.lock().unwrap().leader_id
    }

    // -------------------------------------------------------------
    // Peer lifecycle
    // -------------------------------------------------------------

    fn rebuild_peers(&self) -> Result<()> {
        let config = self.state.lock().unwrap().config.clone();
        let last_log_idx = self.log.next_slot().saturating_sub(1);
        let mut peers = self.peers.lock().unwrap();
        self.free_peer_snapshot_ctxs(&peers);
        peers.clear();
        for server in config.get_servers() {
            if server.id == self.id {
                continue;
            }
            let client = self.client_factory.create_client(&server.endpoint)?;
            let record = Arc::new(PeerRecord::new(
                server.id,
                server.endpoint.clone(),
                server.learner,
                server.priority,
                last_log_idx,
            ));
            let handle = PeerHandle::spawn(
                record,
                client,
                self.peer_result_tx.clone(),
                self.config.client_req_timeout_ms,
            );
            peers.insert(server.id, handle);
        }
        Ok(())
    }

    /// Releases any `snapshot_ctx` still held by a peer about to be torn
    /// down, so a mid-transfer teardown (membership change or shutdown)
    /// never skips `free_user_snp_ctx` (P8 applies on every exit path,
    /// not just transfer completion).
    fn free_peer_snapshot_ctxs(&self, peers: &HashMap<ServerId, PeerHandle>) {
        for handle in peers.values() {
            let mut ctx = handle.record.snapshot_ctx.lock().unwrap().take();
            if ctx.is_some() {
                self.state_machine.free_user_snp_ctx(&mut ctx);
            }
        }
    }

    // -------------------------------------------------------------
    // Background loop: timers + peer response processing
    // -------------------------------------------------------------

    fn run_loop(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            self.drain_peer_results();

            let (role, election_due, heartbeat_due) = {
                let state = self.state.lock().unwrap();
                let now = Instant::now();
                // Jitter the heartbeat period slightly so a cluster's leader
                // doesn't send every peer's heartbeat in lockstep with other
                // clusters sharing the same wall-clock tick.
                let interval_ms = if self.config.enable_randomized_hb {
                    let jitter = self.config.heart_beat_interval_ms / 5;
                    self.config.heart_beat_interval_ms + rand::thread_rng().gen_range(0..=jitter.max(1))
                } else {
                    self.config.heart_beat_interval_ms
                };
                let heartbeat_due = state.role == Role::Leader
                    && now.duration_since(state.last_leader_contact) >= Duration::from_millis(interval_ms);
                (state.role, now >= state.election_deadline, heartbeat_due)
            };

            match role {
                Role::Leader => {
                    if heartbeat_due {
                        self.send_append_entries_to_all();
                    }
                }
                Role::Follower | Role::PreCandidate if election_due => {
                    self.start_pre_vote(false);
                }
                _ => {}
            }

            self.maybe_create_snapshot();

            thread::sleep(Duration::from_millis(10));
        }
    }

    fn drain_peer_results(&self) {
        let rx = self.peer_result_rx.lock().unwrap();
        loop {
            match rx.try_recv() {
                Ok(result) => self.handle_peer_result(result),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn handle_peer_result(&self, result: PeerResult) {
        let resp = match result.outcome {
            Ok(resp) => resp,
            Err(_) => {
                if let Some(handle) = self.peers.lock().unwrap().get(&result.peer_id) {
                    handle.record.mark_unreachable(self.config.rpc_failure_backoff_ms);
                    if handle.record.in_snapshot_sync.swap(false, Ordering::Relaxed) {
                        let mut ctx = handle.record.snapshot_ctx.lock().unwrap().take();
                        if ctx.is_some() {
                            self.state_machine.free_user_snp_ctx(&mut ctx);
                        }
                        log::warn!(
                            "server {} lost peer {} mid-snapshot-transfer, will retry after backoff",
                            self.id,
                            result.peer_id
                        );
                    }
                }
                return;
            }
        };
        if let Some(handle) = self.peers.lock().unwrap().get(&result.peer_id) {
            handle.record.mark_responded();
        }

        self.maybe_step_down(resp.term);

        match &resp.payload {
            RespPayload::RequestVote => self.handle_real_vote_response(result.peer_id, &resp),
            RespPayload::PreVote => self.handle_pre_vote_response(result.peer_id, &resp),
            RespPayload::AppendEntries { conflict_hint } => {
                self.handle_append_entries_response(result.peer_id, &resp, *conflict_hint)
            }
            RespPayload::InstallSnapshot { next_obj_id } => {
                self.handle_install_snapshot_response(result.peer_id, &resp, *next_obj_id)
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------
    // Term handling (spec §4.9b)
    // -------------------------------------------------------------

    fn maybe_step_down(&self, incoming_term: Term) {
        let mut state = self.state.lock().unwrap();
        if incoming_term > state.current_term {
            state.current_term = incoming_term;
            state.voted_for = None;
            let was_leader = state.role == Role::Leader;
            state.role = Role::Follower;
            state.vote_tally = None;
            state.pre_vote_tally = None;
            let _ = self.state_manager.save_state(&DurableState {
                current_term: state.current_term,
                voted_for: None,
                election_timer_allowed: true,
            });
            drop(state);
            log::info!("server {} stepping down to follower, term -> {incoming_term}", self.id);
            if was_leader {
                self.fire(CallbackEvent::BecomeFollower { term: incoming_term });
            }
        }
    }

    // -------------------------------------------------------------
    // Election (C5)
    // -------------------------------------------------------------

    fn start_pre_vote(&self, forced: bool) {
        let (term, last_log_idx, last_log_term, quorum, candidate_priority, leader_priority, since_contact) = {
            let state = self.state.lock().unwrap();
            let last_log_idx = self.log.next_slot().saturating_sub(1);
            let last_log_term = self.log.term_at(last_log_idx);
            let my_priority = state
                .config
                .get_server(self.id)
                .map(|s| s.priority)
                .unwrap_or(crate::srv_config::INIT_PRIORITY);
            let leader_priority = state
                .leader_id
                .and_then(|lid| state.config.get_server(lid))
                .map(|s| s.priority)
                .unwrap_or(0);
            (
                state.current_term,
                last_log_idx,
                last_log_term,
                quorum_size(state.config.voting_member_count()),
                my_priority,
                leader_priority,
                Instant::now().duration_since(state.last_leader_contact),
            )
        };

        if !may_start_election(
            candidate_priority,
            leader_priority,
            since_contact,
            self.config.priority_step_down_ms,
            forced,
        ) {
            self.reset_election_timer();
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.role = Role::PreCandidate;
            state.pre_vote_tally = Some((term + 1, VoteTally::new(term + 1, quorum)));
            state.election_deadline = Instant::now() + random_election_timeout(&self.config);
        }

        log::debug!("server {} starting pre-vote for term {}", self.id, term + 1);
        self.broadcast(ReqPayload::PreVote, term, last_log_idx, last_log_term);
        let _ = PreVoteInput {
            heard_from_leader_recently: false,
            candidate_last_term: last_log_term,
            candidate_last_idx: last_log_idx,
            voter_last_term: last_log_term,
            voter_last_idx: last_log_idx,
        }; // constructed above only to document the grant rule mirrored server-side in handle_pre_vote
    }

    fn handle_pre_vote_response(&self, peer_id: ServerId, resp: &RespMsg) {
        if !resp.accepted {
            return;
        }
        let should_start_real_vote = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::PreCandidate {
                return;
            }
            let quorum_reached = match &mut state.pre_vote_tally {
                Some((term, tally)) if *term == resp.term => tally.record(resp.term, resp.accepted),
                _ => false,
            };
            let _ = peer_id;
            quorum_reached
        };
        if should_start_real_vote {
            self.start_real_vote(false);
        }
    }

    /// Starts a real-vote round. `forced` carries the `force` flag onto
    /// every `RequestVote` broadcast — set when a leadership takeover
    /// notification drives this directly, bypassing pre-vote and the
    /// priority gate entirely.
    fn start_real_vote(&self, forced: bool) {
        let (term, last_log_idx, last_log_term, quorum) = {
            let mut state = self.state.lock().unwrap();
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.id);
            state.pre_vote_tally = None;
            let quorum = quorum_size(state.config.voting_member_count());
            state.vote_tally = Some(VoteTally::new(state.current_term, quorum));
            state.election_deadline = Instant::now() + random_election_timeout(&self.config);
            (
                state.current_term,
                self.log.next_slot().saturating_sub(1),
                self.log.term_at(self.log.next_slot().saturating_sub(1)),
                quorum,
            )
        };
        let _ = self.state_manager.save_state(&DurableState {
            current_term: term,
            voted_for: Some(self.id),
            election_timer_allowed: true,
        });
        let _ = quorum;
        log::info!(
            "server {} became candidate for term {term}, voted for self{}",
            self.id,
            if forced { " (forced)" } else { "" }
        );
        self.broadcast(ReqPayload::RequestVote { force: forced }, term, last_log_idx, last_log_term);
    }

    fn handle_real_vote_response(&self, _peer_id: ServerId, resp: &RespMsg) {
        if !resp.accepted {
            return;
        }
        let became_leader = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Candidate {
                return;
            }
            match &mut state.vote_tally {
                Some(tally) if resp.term == state.current_term => tally.record(resp.term, resp.accepted),
                _ => false,
            }
        };
        if became_leader {
            self.become_leader();
        }
    }

    fn become_leader(&self) {
        let (term, last_log_idx) = {
            let mut state = self.state.lock().unwrap();
            state.role = Role::Leader;
            state.leader_id = Some(self.id);
            state.vote_tally = None;
            (state.current_term, self.log.next_slot().saturating_sub(1))
        };
        for handle in self.peers.lock().unwrap().values() {
            handle.record.set_next_idx(last_log_idx + 1);
            handle.record.set_matched_idx(0);
        }
        // Anchor commit progress with a no-op entry in the new term (spec §4.4).
        self.log.append(LogEntry::new(term, ValueType::AppLog, Vec::new()));
        log::info!("server {} became leader for term {term}", self.id);
        self.fire(CallbackEvent::BecomeLeader { term });
        self.send_append_entries_to_all();
    }

    fn reset_election_timer(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_leader_contact = Instant::now();
        state.election_deadline = Instant::now() + random_election_timeout(&self.config);
    }

    fn broadcast(&self, payload: ReqPayload, term: Term, last_log_idx: LogIndex, last_log_term: Term) {
        let commit_idx = self.state.lock().unwrap().commit_index;
        let peers = self.peers.lock().unwrap();
        for (peer_id, handle) in peers.iter() {
            handle.send(ReqMsg {
                term,
                src: self.id,
                dst: *peer_id,
                last_log_idx,
                last_log_term,
                commit_idx,
                payload: payload.clone(),
            });
        }
    }

    // -------------------------------------------------------------
    // Replication (C6)
    // -------------------------------------------------------------

    fn send_append_entries_to_all(&self) {
        let (term, commit_idx) = {
            let mut state = self.state.lock().unwrap();
            state.last_leader_contact = Instant::now();
            (state.current_term, state.commit_index)
        };
        let batch_hint = self.state_machine.get_next_batch_size_hint_in_bytes();
        let peers = self.peers.lock().unwrap();
        for (peer_id, handle) in peers.iter() {
            if handle.record.in_snapshot_sync.load(Ordering::Relaxed) {
                continue;
            }
            if !handle.record.backoff_elapsed() {
                continue;
            }
            *handle.record.last_heartbeat_sent.lock().unwrap() = Instant::now();
            let plan = plan_append_entries(
                self.log.as_ref(),
                handle.record.next_idx(),
                self.config.max_append_size,
                batch_hint,
            );
            if plan.needs_snapshot {
                self.begin_snapshot_transfer(*peer_id, &handle.record);
                continue;
            }
            handle.send(ReqMsg {
                term,
                src: self.id,
                dst: *peer_id,
                last_log_idx: plan.prev_log_idx,
                last_log_term: plan.prev_log_term,
                commit_idx,
                payload: ReqPayload::AppendEntries { entries: plan.entries },
            });
        }
    }

    fn handle_append_entries_response(&self, peer_id: ServerId, resp: &RespMsg, conflict_hint: Option<LogIndex>) {
        let handle_peer = {
            let peers = self.peers.lock().unwrap();
            peers.get(&peer_id).map(|h| h.record.clone())
        };
        let Some(record) = handle_peer else { return };

        if resp.accepted {
            if let Some(next_idx) = resp.next_idx {
                record.set_matched_idx(next_idx.saturating_sub(1));
                record.set_next_idx(next_idx);
            }
            self.advance_commit_index();
        } else {
            let regress_to = conflict_hint.unwrap_or_else(|| record.next_idx().saturating_sub(1).max(1));
            record.set_next_idx(regress_to);
        }
    }

    fn advance_commit_index(&self) {
        let (quorum, mut matched, current_term, old_commit) = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            let last_log_idx = self.log.next_slot().saturating_sub(1);
            // With pre-fsync dispatch enabled, entries may be appended in
            // memory (and replicated) before they are durable; the leader's
            // own matched index must then track the durable index, not the
            // in-memory tail, so commit never outruns what survives a crash.
            let self_matched = if self.config.parallel_log_appending {
                self.log.last_durable_index()
            } else {
                last_log_idx
            };
            let quorum = quorum_size(state.config.voting_member_count());
            (quorum, vec![self_matched], state.current_term, state.commit_index)
        };
        for handle in self.peers.lock().unwrap().values() {
            if !handle.record.learner {
                matched.push(handle.record.matched_idx());
            }
        }
        let candidate = quorum_commit_index(&matched, quorum);
        if candidate <= old_commit {
            return;
        }
        // No-commit-across-terms safety: only commit through an entry from the current term.
        if self.log.term_at(candidate) != current_term {
            return;
        }
        let adjusted = self
            .state_machine
            .adjust_commit_index(old_commit, candidate, current_term);
        let new_commit = clamp_adjusted_commit_index(adjusted, candidate).max(old_commit);
        if new_commit == old_commit {
            return;
        }
        log::debug!("server {} advancing commit index {old_commit} -> {new_commit}", self.id);
        self.apply_committed_range(old_commit, new_commit);
    }

    fn apply_committed_range(&self, from_exclusive: LogIndex, to_inclusive: LogIndex) {
        let mut idx = from_exclusive + 1;
        let mut results: HashMap<LogIndex, Result<Vec<u8>>> = HashMap::new();
        while idx <= to_inclusive {
            if let Some(entry) = self.log.entry_at(idx) {
                results.insert(idx, self.apply_one_entry(idx, &entry));
            }
            idx += 1;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.commit_index = to_inclusive;
        }
        self.commit_cv.notify_all();
        self.wake_pending(results);
    }

    /// Applies one committed entry, returning whatever a client waiting on
    /// this index should be handed back. Each index is applied exactly
    /// once (invariant I6) — a client's `wait_for_commit` is satisfied from
    /// this result rather than re-invoking `commit`.
    fn apply_one_entry(&self, idx: LogIndex, entry: &LogEntry) -> Result<Vec<u8>> {
        match entry.value_type {
            ValueType::AppLog => self.state_machine.commit(idx, &entry.payload),
            ValueType::ClusterServer => {
                let change = MembershipChange::decode(&entry.payload)?;
                let mut state = self.state.lock().unwrap();
                let next = change.apply_to(&state.config, idx)?;
                state.config = next.clone();
                state.config_change_in_flight = false;
                drop(state);
                self.state_manager.save_config(&next)?;
                self.state_machine.commit_config(idx, &next)?;
                let _ = self.rebuild_peers();
                self.fire(CallbackEvent::ConfigChange);
                Ok(Vec::new())
            }
            ValueType::Config => {
                let cfg = ClusterConfig::from_bytes(&entry.payload)?;
                let mut state = self.state.lock().unwrap();
                state.config = cfg.clone();
                drop(state);
                self.state_machine.commit_config(idx, &cfg)?;
                Ok(Vec::new())
            }
            ValueType::SnapshotSync | ValueType::Pack | ValueType::Custom => Ok(Vec::new()),
        }
    }

    fn wake_pending(&self, mut results: HashMap<LogIndex, Result<Vec<u8>>>) {
        let mut pending = self.pending.lock().unwrap();
        let ready: Vec<LogIndex> = pending.keys().filter(|i| results.contains_key(*i)).copied().collect();
        for idx in ready {
            if let (Some(tx), Some(result)) = (pending.remove(&idx), results.remove(&idx)) {
                let _ = tx.send(result);
            }
        }
    }

    // -------------------------------------------------------------
    // Inbound request handling (C11 dispatch)
    // -------------------------------------------------------------

    pub fn handle_request(&self, req: ReqMsg) -> RespMsg {
        self.maybe_step_down(req.term);
        match req.payload.clone() {
            ReqPayload::RequestVote { force } => self.handle_request_vote(req, force),
            ReqPayload::PreVote => self.handle_pre_vote_request(req),
            ReqPayload::AppendEntries { entries } => self.handle_append_entries_request(req, entries),
            ReqPayload::InstallSnapshot { sync } => self.handle_install_snapshot_request(req, sync),
            ReqPayload::JoinCluster { server } => self.handle_join_cluster(req, server),
            ReqPayload::LeaveCluster { server_id } => self.handle_leave_cluster(req, server_id),
            ReqPayload::SyncLogToNewSrv => self.ack(&req, RespPayload::SyncLogToNewSrv),
            ReqPayload::CustomNotification { notification } => self.handle_custom_notification(req, notification),
            ReqPayload::ClientAppend { data } => self.handle_client_append(req, data),
        }
    }

    fn ack(&self, req: &ReqMsg, payload: RespPayload) -> RespMsg {
        let state = self.state.lock().unwrap();
        RespMsg {
            term: state.current_term,
            src: self.id,
            dst: req.src,
            last_log_idx: self.log.next_slot().saturating_sub(1),
            last_log_term: 0,
            accepted: true,
            next_idx: None,
            payload,
        }
    }

    fn reject(&self, req: &ReqMsg, payload: RespPayload) -> RespMsg {
        let state = self.state.lock().unwrap();
        RespMsg {
            term: state.current_term,
            src: self.id,
            dst: req.src,
            last_log_idx: self.log.next_slot().saturating_sub(1),
            last_log_term: 0,
            accepted: false,
            next_idx: None,
            payload,
        }
    }

    fn handle_pre_vote_request(&self, req: ReqMsg) -> RespMsg {
        let state = self.state.lock().unwrap();
        let heard_recently = Instant::now().duration_since(state.last_leader_contact)
            < Duration::from_millis(self.config.election_min_ms);
        let voter_last_idx = self.log.next_slot().saturating_sub(1);
        let voter_last_term = self.log.term_at(voter_last_idx);
        let granted = grant_pre_vote(&PreVoteInput {
            heard_from_leader_recently: heard_recently,
            candidate_last_term: req.last_log_term,
            candidate_last_idx: req.last_log_idx,
            voter_last_term,
            voter_last_idx,
        });
        RespMsg {
            term: state.current_term,
            src: self.id,
            dst: req.src,
            last_log_idx: voter_last_idx,
            last_log_term: voter_last_term,
            accepted: granted,
            next_idx: None,
            payload: RespPayload::PreVote,
        }
    }

    fn handle_request_vote(&self, req: ReqMsg, force: bool) -> RespMsg {
        let mut state = self.state.lock().unwrap();
        let voter_last_idx = self.log.next_slot().saturating_sub(1);
        let voter_last_term = self.log.term_at(voter_last_idx);
        let granted = force
            || grant_real_vote(&RealVoteInput {
                term: req.term,
                current_term: state.current_term,
                voted_for: state.voted_for,
                candidate_id: req.src,
                candidate_last_term: req.last_log_term,
                candidate_last_idx: req.last_log_idx,
                voter_last_term,
                voter_last_idx,
            });
        if granted {
            state.voted_for = Some(req.src);
            state.role = Role::Follower;
            state.last_leader_contact = Instant::now();
            state.election_deadline = Instant::now() + random_election_timeout(&self.config);
            let _ = self.state_manager.save_state(&DurableState {
                current_term: state.current_term,
                voted_for: Some(req.src),
                election_timer_allowed: true,
            });
        }
        log::debug!(
            "server {} {} vote for {} in term {}",
            self.id,
            if granted { "granted" } else { "denied" },
            req.src,
            req.term
        );
        RespMsg {
            term: state.current_term,
            src: self.id,
            dst: req.src,
            last_log_idx: voter_last_idx,
            last_log_term: voter_last_term,
            accepted: granted,
            next_idx: None,
            payload: RespPayload::RequestVote,
        }
    }

    fn handle_append_entries_request(&self, req: ReqMsg, entries: Vec<LogEntry>) -> RespMsg {
        let current_term = {
            let mut state = self.state.lock().unwrap();
            if req.term < state.current_term {
                return RespMsg {
                    term: state.current_term,
                    src: self.id,
                    dst: req.src,
                    last_log_idx: 0,
                    last_log_term: 0,
                    accepted: false,
                    next_idx: None,
                    payload: RespPayload::AppendEntries { conflict_hint: None },
                };
            }
            state.role = Role::Follower;
            state.leader_id = Some(req.src);
            state.last_leader_contact = Instant::now();
            state.election_deadline = Instant::now() + random_election_timeout(&self.config);
            state.current_term
        };

        let result =
            follower_apply_append_entries(self.log.as_ref(), req.last_log_idx, req.last_log_term, entries);

        if !result.success {
            return RespMsg {
                term: current_term,
                src: self.id,
                dst: req.src,
                last_log_idx: result.last_new_index,
                last_log_term: 0,
                accepted: false,
                next_idx: Some(result.last_new_index + 1),
                payload: RespPayload::AppendEntries {
                    conflict_hint: result.conflict_hint,
                },
            };
        }

        let new_commit = {
            let mut state = self.state.lock().unwrap();
            let updated = follower_commit_index(state.commit_index, req.commit_idx, result.last_new_index);
            let old = state.commit_index;
            state.commit_index = updated;
            (old, updated)
        };
        if new_commit.1 > new_commit.0 {
            self.apply_committed_range(new_commit.0, new_commit.1);
        }

        RespMsg {
            term: current_term,
            src: self.id,
            dst: req.src,
            last_log_idx: result.last_new_index,
            last_log_term: 0,
            accepted: true,
            next_idx: Some(result.last_new_index + 1),
            payload: RespPayload::AppendEntries { conflict_hint: None },
        }
    }

    // -------------------------------------------------------------
    // Snapshot transfer (C7)
    // -------------------------------------------------------------

    fn begin_snapshot_transfer(&self, peer_id: ServerId, record: &Arc<PeerRecord>) {
        log::info!("server {} starting snapshot transfer to peer {peer_id}", self.id);
        record.in_snapshot_sync.store(true, Ordering::Relaxed);
        record.current_snapshot_offset.store(0, Ordering::Relaxed);
        *record.snapshot_ctx.lock().unwrap() = None;
        if needs_out_of_log_range_warning(record.next_idx().saturating_sub(1), self.log.start_index()) {
            self.notify_peer(
                peer_id,
                CustomNotification::OutOfLogRangeWarning {
                    start_idx_of_leader: self.log.start_index(),
                },
            );
        }
        self.send_next_snapshot_chunk(peer_id, record, 0);
    }

    /// Sends object `obj_id` of the current transfer, threading
    /// `record.snapshot_ctx` through the leader-side `StateMachine` calls
    /// across however many separate request/response round-trips the
    /// transfer takes (spec §4.5) — the context lives in the peer record,
    /// not in a call-scoped guard, because a single chunk send does not
    /// span the whole transfer.
    fn send_next_snapshot_chunk(&self, peer_id: ServerId, record: &Arc<PeerRecord>, obj_id: u64) {
        let Some(descriptor) = self.state_machine.last_snapshot() else {
            record.in_snapshot_sync.store(false, Ordering::Relaxed);
            return;
        };
        let mut ctx = record.snapshot_ctx.lock().unwrap().take();
        let chunk = self.state_machine.read_logical_snp_obj(&descriptor, &mut ctx, obj_id);
        let sync = match chunk {
            Ok((data, done)) => SnapshotSyncReq {
                descriptor: descriptor.clone(),
                offset: obj_id,
                data,
                done,
            },
            Err(_) => {
                self.state_machine.free_user_snp_ctx(&mut ctx);
                record.in_snapshot_sync.store(false, Ordering::Relaxed);
                return;
            }
        };
        if sync.done {
            self.state_machine.free_user_snp_ctx(&mut ctx);
        } else {
            *record.snapshot_ctx.lock().unwrap() = ctx;
        }
        let (term, commit_idx) = {
            let state = self.state.lock().unwrap();
            (state.current_term, state.commit_index)
        };
        if let Some(handle) = self.peers.lock().unwrap().get(&peer_id) {
            handle.send(ReqMsg {
                term,
                src: self.id,
                dst: peer_id,
                last_log_idx: sync.descriptor.last_log_idx,
                last_log_term: sync.descriptor.last_log_term,
                commit_idx,
                payload: ReqPayload::InstallSnapshot { sync },
            });
        }
    }

    /// Sends a one-off custom notification to a peer outside the regular
    /// append-entries/vote flow (spec §4.7).
    fn notify_peer(&self, peer_id: ServerId, notification: CustomNotification) {
        let (term, last_log_idx, commit_idx) = {
            let state = self.state.lock().unwrap();
            (state.current_term, self.log.next_slot().saturating_sub(1), state.commit_index)
        };
        if let Some(handle) = self.peers.lock().unwrap().get(&peer_id) {
            handle.send(ReqMsg {
                term,
                src: self.id,
                dst: peer_id,
                last_log_idx,
                last_log_term: self.log.term_at(last_log_idx),
                commit_idx,
                payload: ReqPayload::CustomNotification { notification },
            });
        }
    }

    fn handle_install_snapshot_response(&self, peer_id: ServerId, resp: &RespMsg, next_obj_id: Option<u64>) {
        let record = {
            let peers = self.peers.lock().unwrap();
            peers.get(&peer_id).map(|h| h.record.clone())
        };
        let Some(record) = record else { return };
        match next_obj_id {
            Some(id) => self.send_next_snapshot_chunk(peer_id, &record, id),
            None => {
                record.in_snapshot_sync.store(false, Ordering::Relaxed);
                if resp.accepted {
                    log::info!("server {} finished snapshot transfer to peer {peer_id}", self.id);
                    record.set_next_idx(resp.last_log_idx + 1);
                    record.set_matched_idx(resp.last_log_idx);
                }
            }
        }
    }

    fn handle_install_snapshot_request(&self, req: ReqMsg, sync: SnapshotSyncReq) -> RespMsg {
        let mut obj_id = sync.offset;
        let is_first = sync.offset == 0;
        let applied = follower_apply_snapshot_chunk(self.state_machine.as_ref(), &mut obj_id, is_first, &sync);
        match applied {
            Ok(true) => {
                log::info!(
                    "server {} applied snapshot up to index {} from {}",
                    self.id,
                    sync.descriptor.last_log_idx,
                    req.src
                );
                self.log.compact(sync.descriptor.last_log_idx);
                let mut state = self.state.lock().unwrap();
                state.commit_index = sync.descriptor.last_log_idx;
                state.config = sync.descriptor.last_config.clone();
                let term = state.current_term;
                drop(state);
                RespMsg {
                    term,
                    src: self.id,
                    dst: req.src,
                    last_log_idx: sync.descriptor.last_log_idx,
                    last_log_term: sync.descriptor.last_log_term,
                    accepted: true,
                    next_idx: Some(sync.descriptor.last_log_idx + 1),
                    payload: RespPayload::InstallSnapshot { next_obj_id: None },
                }
            }
            Ok(false) => {
                let term = self.state.lock().unwrap().current_term;
                RespMsg {
                    term,
                    src: self.id,
                    dst: req.src,
                    last_log_idx: 0,
                    last_log_term: 0,
                    accepted: true,
                    next_idx: None,
                    payload: RespPayload::InstallSnapshot { next_obj_id: Some(obj_id) },
                }
            }
            Err(_) => {
                let term = self.state.lock().unwrap().current_term;
                RespMsg {
                    term,
                    src: self.id,
                    dst: req.src,
                    last_log_idx: 0,
                    last_log_term: 0,
                    accepted: false,
                    next_idx: None,
                    payload: RespPayload::InstallSnapshot { next_obj_id: None },
                }
            }
        }
    }

    fn maybe_create_snapshot(&self) {
        let commit_idx = self.state.lock().unwrap().commit_index;
        if !should_create_snapshot(commit_idx, self.log.start_index(), self.config.snapshot_distance) {
            return;
        }
        let config = self.state.lock().unwrap().config.clone();
        let descriptor = SnapshotDescriptor {
            last_log_idx: commit_idx,
            last_log_term: self.log.term_at(commit_idx),
            last_config: config,
            size_bytes: 0,
        };
        log::info!("server {} creating snapshot at commit index {commit_idx}", self.id);
        let log = self.log.clone();
        let id = self.id;
        // Keep the most recent `reserved_log_items` entries uncompacted so a
        // slightly-lagging follower can still be caught up with ordinary
        // AppendEntries instead of being forced straight to snapshot transfer.
        let compact_to = commit_idx.saturating_sub(self.config.reserved_log_items);
        self.state_machine.create_snapshot(
            descriptor,
            Box::new(move |ok| {
                if ok {
                    log.compact(compact_to);
                    log::debug!("server {id} snapshot at {commit_idx} committed locally, compacted to {compact_to}");
                }
            }),
        );
    }

    // -------------------------------------------------------------
    // Membership (C8)
    // -------------------------------------------------------------

    /// `JoinCluster` is a wire message type this engine never sends —
    /// membership changes go through `add_srv` replicating a
    /// `ClusterServer` entry over ordinary `AppendEntries` instead. Reject
    /// rather than silently acking a change that never happened, in case a
    /// peer or a future caller ever does send one.
    fn handle_join_cluster(&self, req: ReqMsg, server: ClusterServer) -> RespMsg {
        log::warn!(
            "server {} rejecting unsupported JoinCluster wire request for {} (use add_srv instead)",
            self.id,
            server.id
        );
        self.reject(&req, RespPayload::JoinCluster)
    }

    /// See [`Self::handle_join_cluster`]; `remove_srv` is the real removal
    /// path.
    fn handle_leave_cluster(&self, req: ReqMsg, server_id: ServerId) -> RespMsg {
        log::warn!(
            "server {} rejecting unsupported LeaveCluster wire request for {server_id} (use remove_srv instead)",
            self.id
        );
        self.reject(&req, RespPayload::LeaveCluster)
    }

    /// Client-facing: begins adding `server` as a learner and blocks until
    /// it has caught up and the promotion commits, or the catch-up
    /// timeout elapses (spec §4.6).
    pub fn add_srv(&self, server: ClusterServer) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return Err(Error::NotLeader { known_leader: state.leader_id });
            }
            if state.config.contains(server.id) {
                return Err(Error::ServerAlreadyExists(server.id));
            }
            if state.config_change_in_flight {
                return Err(Error::ConfigChanging);
            }
            state.config_change_in_flight = true;
            state.catch_up = Some(CatchUpTracker::new(server.id, self.config.new_server_catch_up_timeout_ms));
        }

        let learner = server.clone().learner(true);
        self.append_membership_entry(MembershipChange::Add(learner))?;
        self.rebuild_peers()?;

        let deadline = Instant::now() + Duration::from_millis(self.config.new_server_catch_up_timeout_ms);
        loop {
            let last_log_idx = self.log.next_slot().saturating_sub(1);
            let matched = self
                .peers
                .lock()
                .unwrap()
                .get(&server.id)
                .map(|h| h.record.matched_idx())
                .unwrap_or(0);
            let outcome = {
                let state = self.state.lock().unwrap();
                state
                    .catch_up
                    .as_ref()
                    .map(|t| t.poll(matched, last_log_idx, self.config.log_sync_stop_gap))
                    .unwrap_or(CatchUpOutcome::TimedOut)
            };
            match outcome {
                CatchUpOutcome::ReadyToPromote => break,
                CatchUpOutcome::TimedOut => {
                    self.state.lock().unwrap().config_change_in_flight = false;
                    return Err(Error::Cancelled("new server failed to catch up in time"));
                }
                CatchUpOutcome::StillCatchingUp => {
                    if Instant::now() >= deadline {
                        self.state.lock().unwrap().config_change_in_flight = false;
                        return Err(Error::Timeout);
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            }
        }

        self.state.lock().unwrap().catch_up = None;
        self.append_membership_entry(MembershipChange::Add(server))
    }

    /// Client-facing: removes `server` from the cluster. If it is the
    /// current leader, this drives leadership transfer first (spec §4.6)
    /// and then refuses — a leader cannot remove itself from its own
    /// membership entry, so the caller must retry against whoever wins
    /// the forced vote.
    pub fn remove_srv(&self, server_id: ServerId) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return Err(Error::NotLeader { known_leader: state.leader_id });
            }
            if !state.config.contains(server_id) {
                return Err(Error::ServerNotFound(server_id));
            }
            if state.config_change_in_flight {
                return Err(Error::ConfigChanging);
            }
        }

        if server_id == self.id {
            self.begin_leadership_transfer()?;
            return Err(Error::NotLeader {
                known_leader: self.state.lock().unwrap().leader_id,
            });
        }

        self.state.lock().unwrap().config_change_in_flight = true;
        self.append_membership_entry(MembershipChange::Remove(server_id))
    }

    /// Leader-side leadership transfer (spec §4.6): used both when a
    /// follower sends `request_resignation` and when `remove_srv` targets
    /// the current leader itself. Picks the highest-priority, most
    /// caught-up voting peer, waits up to one election timeout for it to
    /// fully match this leader's log, sends it a forced `leadership_takeover`
    /// notification, then gives it one more election timeout to win the
    /// resulting forced vote before resuming normal operation (spec's "if T
    /// fails to win, the leader resumes").
    fn begin_leadership_transfer(&self) -> Result<()> {
        let (role, known_leader, config) = {
            let state = self.state.lock().unwrap();
            (state.role, state.leader_id, state.config.clone())
        };
        if role != Role::Leader {
            return Err(Error::NotLeader { known_leader });
        }
        let last_log_idx = self.log.next_slot().saturating_sub(1);

        let candidates: Vec<(ClusterServer, LogIndex)> = {
            let peers = self.peers.lock().unwrap();
            peers
                .values()
                .filter_map(|h| config.get_server(h.record.id).map(|s| (s.clone(), h.record.matched_idx())))
                .collect()
        };
        let target_id = pick_transfer_target(candidates.iter().map(|(s, m)| (s, *m)))
            .ok_or_else(|| Error::Failed("no eligible leadership transfer target".into()))?;

        log::info!("server {} beginning leadership transfer to {target_id}", self.id);
        let catch_up_deadline = Instant::now() + random_election_timeout(&self.config);
        loop {
            let matched = self
                .peers
                .lock()
                .unwrap()
                .get(&target_id)
                .map(|h| h.record.matched_idx())
                .unwrap_or(0);
            let timed_out = Instant::now() >= catch_up_deadline;
            match advance_leadership_transfer(matched, last_log_idx, false, timed_out, false) {
                TransferState::ReadyToSendTakeover => break,
                TransferState::WaitingForTargetToMatch if !timed_out => {
                    thread::sleep(Duration::from_millis(10));
                }
                _ => {
                    log::warn!(
                        "server {} aborting leadership transfer: {target_id} never caught up",
                        self.id
                    );
                    return Err(Error::Timeout);
                }
            }
        }

        self.notify_peer(target_id, CustomNotification::LeadershipTakeover);

        let resume_deadline = Instant::now() + random_election_timeout(&self.config);
        while Instant::now() < resume_deadline {
            if self.state.lock().unwrap().role != Role::Leader {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(10));
        }
        log::info!(
            "server {} resuming leadership: {target_id} did not win the forced vote in time",
            self.id
        );
        Ok(())
    }

    fn append_membership_entry(&self, change: MembershipChange) -> Result<()> {
        let entry = LogEntry::new(
            self.state.lock().unwrap().current_term,
            ValueType::ClusterServer,
            change.encode(),
        );
        let idx = self.log.append(entry);
        self.wait_for_commit(idx).map(|_| ())
    }

    // -------------------------------------------------------------
    // Custom notifications (C9)
    // -------------------------------------------------------------

    fn handle_custom_notification(&self, req: ReqMsg, notification: CustomNotification) -> RespMsg {
        match decide_request_action(&notification) {
            NotificationAction::EnterOutOfLogRange { start_idx_of_leader } => {
                let mut state = self.state.lock().unwrap();
                state.out_of_log_range = true;
                state.last_leader_contact = Instant::now();
                drop(state);
                self.fire(CallbackEvent::OutOfLogRangeWarning { start_idx_of_leader });
            }
            NotificationAction::ForceElection => {
                // A leadership takeover skips pre-vote entirely and goes
                // straight to a forced real vote (the original's
                // `handle_leadership_takeover` calls `initiate_vote(true)`
                // directly, never the pre-vote path).
                self.start_real_vote(true);
            }
            NotificationAction::BeginResignationTransfer => {
                // Leader-only path; a follower that receives this by
                // mistake is simply not leader and the call below no-ops.
                if let Err(e) = self.begin_leadership_transfer() {
                    log::warn!("server {} could not honor resignation request: {e}", self.id);
                }
            }
            NotificationAction::None => {}
        }
        self.ack(&req, RespPayload::CustomNotification { notification: None })
    }

    // -------------------------------------------------------------
    // Client-facing append API (C10 auto-forward integration)
    // -------------------------------------------------------------

    /// Appends `data` as an application log entry. If this server is not
    /// the leader and auto-forwarding is enabled, transparently proxies
    /// to the current leader over a dedicated `ClientAppend` RPC (spec
    /// §4.8) — distinct from `AppendEntries` so the leader never mistakes
    /// a forwarded write for a peer's own replication message; otherwise
    /// returns `NotLeader`.
    pub fn append_entries(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let (is_leader, term, leader_id, leader_endpoint) = {
            let state = self.state.lock().unwrap();
            let leader_id = state.leader_id;
            let leader_endpoint = leader_id.and_then(|lid| state.config.get_server(lid)).map(|s| s.endpoint.clone());
            (state.role == Role::Leader, state.current_term, leader_id, leader_endpoint)
        };

        if !is_leader {
            if !self.config.auto_forwarding {
                return Err(Error::NotLeader { known_leader: leader_id });
            }
            let (leader_id, endpoint) = match (leader_id, leader_endpoint) {
                (Some(lid), Some(ep)) => (lid, ep),
                _ => return Err(Error::NotLeader { known_leader: None }),
            };
            let req = ReqMsg {
                term,
                src: self.id,
                dst: leader_id,
                last_log_idx: 0,
                last_log_term: 0,
                commit_idx: 0,
                payload: ReqPayload::ClientAppend { data },
            };
            let resp = self.forward_pool.forward_blocking(leader_id, &endpoint, req)?;
            return if resp.accepted {
                match resp.payload {
                    RespPayload::ClientAppend { data } => Ok(data),
                    _ => Ok(Vec::new()),
                }
            } else {
                Err(Error::Failed("leader rejected forwarded request".into()))
            };
        }

        let entry = LogEntry::new(term, ValueType::AppLog, data);
        let idx = self.log.append(entry);
        self.send_append_entries_to_all();
        self.wait_for_commit(idx)
    }

    /// Leader-side handler for a write relayed by a follower under
    /// auto-forwarding (spec §4.8). Delegates to [`Self::append_entries`]
    /// so a forwarded write is applied exactly like a local one.
    fn handle_client_append(&self, req: ReqMsg, data: Vec<u8>) -> RespMsg {
        let (accepted, payload) = match self.append_entries(data) {
            Ok(result) => (true, RespPayload::ClientAppend { data: result }),
            Err(_) => (false, RespPayload::ClientAppend { data: Vec::new() }),
        };
        let term = self.state.lock().unwrap().current_term;
        RespMsg {
            term,
            src: self.id,
            dst: req.src,
            last_log_idx: 0,
            last_log_term: 0,
            accepted,
            next_idx: None,
            payload,
        }
    }

    fn wait_for_commit(&self, idx: LogIndex) -> Result<Vec<u8>> {
        let (tx, rx) = channel();
        self.pending.lock().unwrap().insert(idx, tx);
        match rx.recv_timeout(Duration::from_millis(self.config.client_req_timeout_ms)) {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().unwrap().remove(&idx);
                Err(Error::Timeout)
            }
        }
    }

    // -------------------------------------------------------------
    // Shutdown (spec §5)
    // -------------------------------------------------------------

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.forward_pool.shutdown();
        let mut peers = self.peers.lock().unwrap();
        self.free_peer_snapshot_ctxs(&peers);
        peers.clear();
        drop(peers);
        let _ = self.log.flush();
        let was_leader = self.state.lock().unwrap().role == Role::Leader;
        if was_leader {
            self.fire(CallbackEvent::BecomeResigned);
        }
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.background.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn random_election_timeout(config: &RaftConfig) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(config.election_min_ms..=config.election_max_ms))
}

//! Peer record (C2, spec §3/§4.2).
//!
//! Each peer runs on its own background thread, as in the teacher's
//! `Peer`/`PeerHandle` split — the orchestrator hands a peer thread one
//! RPC at a time over an `mpsc` channel and gets the result back on
//! another, so a slow or wedged peer never blocks the orchestrator's
//! coarse lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::Result;
use crate::message::{ReqMsg, RespMsg};
use crate::traits::{RpcClient, SnpCtx};
use crate::types::{LogIndex, ServerId};

/// Leader-local replication bookkeeping for one peer (spec §3's "Peer
/// record"). Plain data, read/written under the orchestrator's coarse
/// lock or via the atomics below for fields the peer thread touches
/// independently.
pub struct PeerRecord {
    pub id: ServerId,
    pub endpoint: String,
    pub learner: bool,
    pub priority: i32,
    pub next_idx: AtomicU64,
    pub matched_idx: AtomicU64,
    pub busy: AtomicBool,
    pub in_snapshot_sync: AtomicBool,
    pub current_snapshot_offset: AtomicU64,
    pub backoff_ms: AtomicU64,
    pub connection_alive: AtomicBool,
    pub last_heartbeat_sent: Mutex<Instant>,
    pub last_resp_received: Mutex<Instant>,
    /// Persists a snapshot transfer's `SnpCtx` across the several chunk
    /// round-trips a single transfer spans (spec §4.5, P8's partner: the
    /// context lives until the transfer completes or this peer is torn
    /// down, at which point it is released via `free_user_snp_ctx`).
    pub snapshot_ctx: Mutex<Option<SnpCtx>>,
}

impl PeerRecord {
    pub fn new(id: ServerId, endpoint: impl Into<String>, learner: bool, priority: i32, last_log_idx: LogIndex) -> Self {
        let now = Instant::now();
        PeerRecord {
            id,
            endpoint: endpoint.into(),
            learner,
            priority,
            next_idx: AtomicU64::new(last_log_idx + 1),
            matched_idx: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            in_snapshot_sync: AtomicBool::new(false),
            current_snapshot_offset: AtomicU64::new(0),
            backoff_ms: AtomicU64::new(0),
            connection_alive: AtomicBool::new(true),
            last_heartbeat_sent: Mutex::new(now),
            last_resp_received: Mutex::new(now),
            snapshot_ctx: Mutex::new(None),
        }
    }

    pub fn next_idx(&self) -> LogIndex {
        self.next_idx.load(Ordering::Acquire)
    }

    pub fn set_next_idx(&self, idx: LogIndex) {
        self.next_idx.store(idx, Ordering::Release);
    }

    pub fn matched_idx(&self) -> LogIndex {
        self.matched_idx.load(Ordering::Acquire)
    }

    pub fn set_matched_idx(&self, idx: LogIndex) {
        self.matched_idx.store(idx, Ordering::Release);
    }

    pub fn mark_responded(&self) {
        *self.last_resp_received.lock().unwrap() = Instant::now();
        self.connection_alive.store(true, Ordering::Relaxed);
        self.backoff_ms.store(0, Ordering::Relaxed);
    }

    pub fn mark_unreachable(&self, cap_ms: u64) {
        self.connection_alive.store(false, Ordering::Relaxed);
        let current = self.backoff_ms.load(Ordering::Relaxed);
        self.backoff_ms
            .store(crate::snapshot_transfer::next_backoff_ms(current, cap_ms), Ordering::Relaxed);
    }

    /// Whether enough time has passed since the last send attempt to
    /// retry an unreachable peer (spec §4.5's retry backoff).
    pub fn backoff_elapsed(&self) -> bool {
        if self.connection_alive.load(Ordering::Relaxed) {
            return true;
        }
        let since = self.last_heartbeat_sent.lock().unwrap().elapsed().as_millis() as u64;
        since >= self.backoff_ms.load(Ordering::Relaxed)
    }
}

/// What the orchestrator hands a peer thread to send.
pub enum PeerThreadMsg {
    Send(ReqMsg),
    Shutdown,
}

/// What a peer thread reports back.
pub struct PeerResult {
    pub peer_id: ServerId,
    pub outcome: Result<RespMsg>,
}

/// Handle the orchestrator holds for a live peer thread.
pub struct PeerHandle {
    pub record: Arc<PeerRecord>,
    to_peer: Sender<PeerThreadMsg>,
    thread: Option<JoinHandle<()>>,
}

impl PeerHandle {
    /// Spawns a background thread that forwards whatever is sent to it
    /// over `client` and reports the outcome on `to_main`.
    pub fn spawn(
        record: Arc<PeerRecord>,
        client: Arc<dyn RpcClient>,
        to_main: Sender<PeerResult>,
        timeout_ms: u64,
    ) -> PeerHandle {
        let (to_peer, from_main): (Sender<PeerThreadMsg>, Receiver<PeerThreadMsg>) = channel();
        let peer_id = record.id;
        let thread = thread::spawn(move || loop {
            match from_main.recv() {
                Ok(PeerThreadMsg::Send(req)) => {
                    let outcome = client.send(req, timeout_ms);
                    if to_main.send(PeerResult { peer_id, outcome }).is_err() {
                        break;
                    }
                }
                Ok(PeerThreadMsg::Shutdown) | Err(_) => break,
            }
        });

        PeerHandle {
            record,
            to_peer,
            thread: Some(thread),
        }
    }

    /// Non-blocking: enqueues a request for the peer thread to send.
    /// Silently drops if the peer thread has already exited — the
    /// orchestrator will notice via `connection_alive`/timeouts.
    pub fn send(&self, req: ReqMsg) {
        let _ = self.to_peer.send(PeerThreadMsg::Send(req));
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        let _ = self.to_peer.send(PeerThreadMsg::Shutdown);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ReqPayload, RespPayload};
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::Duration;

    struct EchoClient;
    impl RpcClient for EchoClient {
        fn send(&self, req: ReqMsg, _timeout_ms: u64) -> Result<RespMsg> {
            Ok(RespMsg {
                term: req.term,
                src: req.dst,
                dst: req.src,
                last_log_idx: 0,
                last_log_term: 0,
                accepted: true,
                next_idx: None,
                payload: RespPayload::AppendEntries { conflict_hint: None },
            })
        }
    }

    #[test]
    fn peer_thread_roundtrips_a_request() {
        let record = Arc::new(PeerRecord::new(2, "peer:1", false, 1, 0));
        let (tx, rx) = channel();
        let handle = PeerHandle::spawn(record, Arc::new(EchoClient), tx, 1000);
        handle.send(ReqMsg {
            term: 1,
            src: 1,
            dst: 2,
            last_log_idx: 0,
            last_log_term: 0,
            commit_idx: 0,
            payload: ReqPayload::AppendEntries { entries: vec![] },
        });
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.peer_id, 2);
        assert!(result.outcome.unwrap().accepted);
    }

    #[test]
    fn drop_joins_the_peer_thread() {
        let record = Arc::new(PeerRecord::new(3, "peer:2", false, 1, 0));
        let (tx, rx) = channel();
        {
            let _handle = PeerHandle::spawn(record, Arc::new(EchoClient), tx, 1000);
        }
        // Thread exits on drop; nothing further is ever sent.
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)), Err(RecvTimeoutError::Timeout));
    }
}

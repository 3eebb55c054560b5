//! External collaborator interfaces (spec §6).
//!
//! These are capability sets the consuming application implements; the
//! engine only calls through them. Object-safe so the orchestrator can hold
//! `Arc<dyn Trait + Send + Sync>` without generic explosion, matching the
//! "polymorphic traits/interfaces with dynamic dispatch" guidance.

use crate::error::Result;
use crate::log_entry::LogEntry;
use crate::snapshot::SnapshotDescriptor;
use crate::srv_config::ClusterConfig;
use crate::state::DurableState;
use crate::types::{LogIndex, ServerId, Term};

/// Opaque context a state machine attaches to a single snapshot read
/// session; released via [`StateMachine::free_user_snp_ctx`] on every exit
/// path (spec §4.5, property P8).
pub type SnpCtx = Box<dyn std::any::Any + Send>;

/// The replicated state machine. Applies committed entries in strict log
/// order (invariant I6) and produces/consumes logical snapshots.
pub trait StateMachine: Send + Sync {
    /// Optional pre-commit hook; return value, if any, is surfaced back to
    /// the client alongside the final commit result.
    fn pre_commit(&self, _idx: LogIndex, _data: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Apply `data` at `idx`. Called exactly once per index, strictly in
    /// increasing order, with no gaps (invariant I6).
    fn commit(&self, idx: LogIndex, data: &[u8]) -> Result<Vec<u8>>;

    /// Undo a `pre_commit` that will never be committed (e.g. leadership
    /// lost before the entry could be replicated).
    fn rollback(&self, _idx: LogIndex, _data: &[u8]) {}

    /// Invoked exactly when the config entry at `idx` is applied.
    fn commit_config(&self, idx: LogIndex, new_config: &ClusterConfig) -> Result<()>;

    /// Install a complete snapshot, replacing all prior state.
    fn apply_snapshot(&self, snapshot: &SnapshotDescriptor) -> Result<bool>;

    /// Read snapshot object `obj_id` (0 = metadata). `ctx` is created on
    /// the first call for a given transfer and threaded through
    /// subsequent calls until `free_user_snp_ctx` releases it.
    fn read_logical_snp_obj(
        &self,
        snapshot: &SnapshotDescriptor,
        ctx: &mut Option<SnpCtx>,
        obj_id: u64,
    ) -> Result<(Vec<u8>, bool)>;

    /// Persist snapshot object `obj_id`. Implementations may increment
    /// `obj_id` in place to request a different next object than the
    /// trivial `+1`.
    fn save_logical_snp_obj(
        &self,
        snapshot: &SnapshotDescriptor,
        obj_id: &mut u64,
        data: &[u8],
        is_first: bool,
        is_last: bool,
    ) -> Result<()>;

    /// Release reader/writer resources tied to a snapshot transfer.
    /// Guaranteed to be called on every exit path (success, failure,
    /// cancellation).
    fn free_user_snp_ctx(&self, _ctx: &mut Option<SnpCtx>) {}

    fn last_snapshot(&self) -> Option<SnapshotDescriptor>;

    fn last_commit_index(&self) -> LogIndex;

    /// Optionally asynchronous: may return before compaction has actually
    /// run; `done_cb` fires when it has.
    fn create_snapshot(&self, snapshot: SnapshotDescriptor, done_cb: Box<dyn FnOnce(bool) + Send>);

    /// Caps the byte size of a subsequent `AppendEntries` payload.
    /// `None` means "no preference"; `Some(0)` asks the engine to pause
    /// sending until a future call raises the hint again.
    fn get_next_batch_size_hint_in_bytes(&self) -> Option<i64> {
        None
    }

    /// Lets the state machine further lower the leader's computed commit
    /// index (e.g. to wait for specific followers). The engine clamps the
    /// result to never exceed the quorum-computed index (spec §9).
    fn adjust_commit_index(
        &self,
        _current_commit_idx: LogIndex,
        quorum_idx: LogIndex,
        _term: Term,
    ) -> LogIndex {
        quorum_idx
    }
}

/// An ordered, append-mostly store of log entries with compaction
/// (spec §6).
pub trait LogStore: Send + Sync {
    /// First available slot; starts at 1.
    fn next_slot(&self) -> LogIndex;

    /// Start index of the store; 1 initially, may rise after compaction.
    fn start_index(&self) -> LogIndex;

    /// Dummy zero-term entry if the store is empty.
    fn last_entry(&self) -> LogEntry;

    fn append(&self, entry: LogEntry) -> LogIndex;

    /// Overwrites the entry at `index`, truncating any suffix.
    fn write_at(&self, index: LogIndex, entry: LogEntry);

    fn end_of_append_batch(&self, _start: LogIndex, _cnt: u64) {}

    /// `[start, end)`. `None` signals an error (e.g. external truncation
    /// raced the read).
    fn log_entries(&self, start: LogIndex, end: LogIndex) -> Option<Vec<LogEntry>>;

    /// Same as `log_entries` but may stop early once the returned batch
    /// would exceed `batch_size_hint_in_bytes`.
    fn log_entries_ext(
        &self,
        start: LogIndex,
        end: LogIndex,
        batch_size_hint_in_bytes: Option<i64>,
    ) -> Option<Vec<LogEntry>> {
        let entries = self.log_entries(start, end)?;
        match batch_size_hint_in_bytes {
            Some(hint) if hint > 0 => {
                let mut total = 0i64;
                let mut out = Vec::new();
                for e in entries {
                    total += e.payload.len() as i64;
                    out.push(e);
                    if total >= hint {
                        break;
                    }
                }
                Some(out)
            }
            _ => Some(entries),
        }
    }

    /// `None` if `index >= next_slot()`.
    fn entry_at(&self, index: LogIndex) -> Option<LogEntry>;

    /// `0` if `index < start_index()`.
    fn term_at(&self, index: LogIndex) -> Term;

    fn pack(&self, index: LogIndex, cnt: u32) -> Vec<u8>;

    fn apply_pack(&self, index: LogIndex, pack: &[u8]);

    /// Purge entries up to and including `last_log_index`. Synchronous.
    fn compact(&self, last_log_index: LogIndex) -> bool;

    /// Asynchronous compaction: `start_index()` must reflect the new
    /// start immediately even though disk IO may still be running.
    fn compact_async(&self, last_log_index: LogIndex, done_cb: Box<dyn FnOnce(bool) + Send>) {
        let ok = self.compact(last_log_index);
        done_cb(ok);
    }

    fn flush(&self) -> bool;

    /// Only meaningful with `parallel_log_appending_`; defaults to
    /// `next_slot() - 1` for stores that fsync synchronously on append.
    fn last_durable_index(&self) -> LogIndex {
        self.next_slot().saturating_sub(1)
    }
}

/// Persists durable server state (current term, voted-for, cluster
/// membership) across restarts (spec §6).
pub trait StateManager: Send + Sync {
    fn load_config(&self) -> Result<ClusterConfig>;
    fn save_config(&self, config: &ClusterConfig) -> Result<()>;
    fn save_state(&self, state: &DurableState) -> Result<()>;
    fn read_state(&self) -> Result<DurableState>;
    fn server_id(&self) -> ServerId;

    /// Called when a fsync failure or other unrecoverable error leaves the
    /// server unable to continue safely (spec §7, "Recovery policy").
    fn system_exit(&self, code: i32);
}

/// A single outstanding RPC client bound to one peer endpoint.
pub trait RpcClient: Send + Sync {
    /// Sends `req` and blocks for at most `timeout_ms`.
    fn send(
        &self,
        req: crate::message::ReqMsg,
        timeout_ms: u64,
    ) -> Result<crate::message::RespMsg>;

    /// Whether the underlying connection has been observed dead and
    /// should not be returned to an auto-forward pool.
    fn is_abandoned(&self) -> bool {
        false
    }
}

/// Creates [`RpcClient`]s bound to a peer endpoint.
pub trait RpcClientFactory: Send + Sync {
    fn create_client(&self, endpoint: &str) -> Result<std::sync::Arc<dyn RpcClient>>;
}

/// Accepts inbound RPCs and dispatches them to the orchestrator.
pub trait RpcListener: Send + Sync {
    fn listen(&self, handler: std::sync::Arc<dyn Fn(crate::message::ReqMsg) -> crate::message::RespMsg + Send + Sync>) -> Result<()>;
    fn stop(&self);
}

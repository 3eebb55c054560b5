//! In-memory test/demo fixtures for the external collaborator traits.
//!
//! None of this is meant for production use — spec.md explicitly scopes
//! production log stores, state machines, state managers and transports
//! out of this crate. These exist so the engine's own test suite (and a
//! consumer's early prototyping) has something to plug into the traits in
//! [`crate::traits`] without writing a real backend first.
//!
//! Grounded on the teacher repo's own `mod log { ... MemoryLog ... }` and
//! its test helpers (`log::mocks::new_mock_log`), and on
//! `examples/original_source/examples/calculator/calc_server.cxx` for the
//! calculator state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::log_entry::LogEntry;
use crate::message::codec::{Reader, WireCodec, Writer};
use crate::message::{ReqMsg, RespMsg};
use crate::snapshot::SnapshotDescriptor;
use crate::srv_config::ClusterConfig;
use crate::state::DurableState;
use crate::traits::{LogStore, RpcClient, RpcClientFactory, RpcListener, SnpCtx, StateMachine, StateManager};
use crate::types::{LogIndex, ServerId, Term};

// ---------------------------------------------------------------------
// Log store
// ---------------------------------------------------------------------

struct MemoryLogInner {
    /// `entries[0]` holds the entry at index `start_index`.
    entries: Vec<LogEntry>,
    start_index: LogIndex,
}

/// An in-memory [`LogStore`]. Not durable; `flush`/`last_durable_index`
/// are trivially "always synced".
pub struct MemoryLogStore {
    inner: Mutex<MemoryLogInner>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        MemoryLogStore {
            inner: Mutex::new(MemoryLogInner {
                entries: Vec::new(),
                start_index: 1,
            }),
        }
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLogStore {
    fn next_slot(&self) -> LogIndex {
        let inner = self.inner.lock().unwrap();
        inner.start_index + inner.entries.len() as LogIndex
    }

    fn start_index(&self) -> LogIndex {
        self.inner.lock().unwrap().start_index
    }

    fn last_entry(&self) -> LogEntry {
        self.inner
            .lock()
            .unwrap()
            .entries
            .last()
            .cloned()
            .unwrap_or_else(LogEntry::dummy)
    }

    fn append(&self, entry: LogEntry) -> LogIndex {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push(entry);
        inner.start_index + inner.entries.len() as LogIndex - 1
    }

    fn write_at(&self, index: LogIndex, entry: LogEntry) {
        let mut inner = self.inner.lock().unwrap();
        let start = inner.start_index;
        assert!(index >= start, "write_at below start_index");
        let offset = (index - start) as usize;
        inner.entries.truncate(offset);
        inner.entries.push(entry);
    }

    fn log_entries(&self, start: LogIndex, end: LogIndex) -> Option<Vec<LogEntry>> {
        if end < start {
            return Some(Vec::new());
        }
        let inner = self.inner.lock().unwrap();
        if start < inner.start_index {
            return None;
        }
        let base = inner.start_index;
        let lo = (start - base) as usize;
        let hi = ((end - base) as usize).min(inner.entries.len());
        if lo > hi {
            return Some(Vec::new());
        }
        Some(inner.entries[lo..hi].to_vec())
    }

    fn entry_at(&self, index: LogIndex) -> Option<LogEntry> {
        let inner = self.inner.lock().unwrap();
        if index < inner.start_index {
            return None;
        }
        let offset = (index - inner.start_index) as usize;
        inner.entries.get(offset).cloned()
    }

    fn term_at(&self, index: LogIndex) -> Term {
        if index == 0 {
            return 0;
        }
        let inner = self.inner.lock().unwrap();
        if index < inner.start_index {
            return 0;
        }
        let offset = (index - inner.start_index) as usize;
        inner.entries.get(offset).map(|e| e.term).unwrap_or(0)
    }

    fn pack(&self, index: LogIndex, cnt: u32) -> Vec<u8> {
        let entries = self
            .log_entries(index, index + cnt as LogIndex)
            .unwrap_or_default();
        let mut w = Writer::new();
        w.put_u32(entries.len() as u32);
        for e in &entries {
            w.put_bytes(&e.to_bytes());
        }
        w.into_bytes()
    }

    fn apply_pack(&self, index: LogIndex, pack: &[u8]) {
        let mut r = Reader::new(pack);
        let count = r.get_u32().unwrap_or(0);
        let mut idx = index;
        for _ in 0..count {
            let bytes = r.get_bytes().expect("well-formed pack");
            let entry = LogEntry::from_bytes(&bytes).expect("well-formed pack entry");
            self.write_at(idx, entry);
            idx += 1;
        }
    }

    fn compact(&self, last_log_index: LogIndex) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let new_start = last_log_index + 1;
        if new_start <= inner.start_index {
            return true;
        }
        let drop_count = (new_start - inner.start_index).min(inner.entries.len() as LogIndex) as usize;
        inner.entries.drain(0..drop_count);
        inner.start_index = new_start;
        true
    }

    fn flush(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------
// State manager
// ---------------------------------------------------------------------

pub struct MemoryStateManager {
    id: ServerId,
    state: Mutex<DurableState>,
    config: Mutex<ClusterConfig>,
    exited: AtomicBool,
}

impl MemoryStateManager {
    pub fn new(id: ServerId, initial_config: ClusterConfig) -> Self {
        MemoryStateManager {
            id,
            state: Mutex::new(DurableState::initial()),
            config: Mutex::new(initial_config),
            exited: AtomicBool::new(false),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl StateManager for MemoryStateManager {
    fn load_config(&self) -> Result<ClusterConfig> {
        Ok(self.config.lock().unwrap().clone())
    }

    fn save_config(&self, config: &ClusterConfig) -> Result<()> {
        *self.config.lock().unwrap() = config.clone();
        Ok(())
    }

    fn save_state(&self, state: &DurableState) -> Result<()> {
        *self.state.lock().unwrap() = *state;
        Ok(())
    }

    fn read_state(&self) -> Result<DurableState> {
        Ok(*self.state.lock().unwrap())
    }

    fn server_id(&self) -> ServerId {
        self.id
    }

    fn system_exit(&self, code: i32) {
        log::error!("state manager for server {} fatally exiting: code {code}", self.id);
        self.exited.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------
// Calculator state machine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl CalcOp {
    fn tag(self) -> u8 {
        match self {
            CalcOp::Add => 0,
            CalcOp::Sub => 1,
            CalcOp::Mul => 2,
            CalcOp::Div => 3,
        }
    }
}

/// Encodes `(op, operand)` the way a client submits it to `append_entries`.
pub fn encode_calc_op(op: CalcOp, operand: i64) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(op.tag());
    w.put_i64(operand);
    w.into_bytes()
}

struct CalcInner {
    value: i64,
    staged_snapshot_value: Option<i64>,
    last_commit_index: LogIndex,
}

/// A tiny calculator state machine: applies `+ - * /` to a running `i64`.
/// Grounded on `examples/original_source/examples/calculator/calc_server.cxx`.
pub struct CalculatorStateMachine {
    inner: Mutex<CalcInner>,
}

impl CalculatorStateMachine {
    pub fn new() -> Self {
        CalculatorStateMachine {
            inner: Mutex::new(CalcInner {
                value: 0,
                staged_snapshot_value: None,
                last_commit_index: 0,
            }),
        }
    }

    pub fn value(&self) -> i64 {
        self.inner.lock().unwrap().value
    }
}

impl Default for CalculatorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for CalculatorStateMachine {
    fn commit(&self, idx: LogIndex, data: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(data);
        let tag = r.get_u8().map_err(|e| Error::BadRequest(e.to_string()))?;
        let operand = r.get_i64().map_err(|e| Error::BadRequest(e.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        inner.value = match tag {
            0 => inner.value + operand,
            1 => inner.value - operand,
            2 => inner.value * operand,
            3 => {
                if operand == 0 {
                    return Err(Error::BadRequest("division by zero".into()));
                }
                inner.value / operand
            }
            other => return Err(Error::BadRequest(format!("unknown calc op {other}"))),
        };
        inner.last_commit_index = idx;
        let mut w = Writer::new();
        w.put_i64(inner.value);
        Ok(w.into_bytes())
    }

    fn commit_config(&self, idx: LogIndex, _new_config: &ClusterConfig) -> Result<()> {
        self.inner.lock().unwrap().last_commit_index = idx;
        Ok(())
    }

    fn apply_snapshot(&self, snapshot: &SnapshotDescriptor) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let staged = inner
            .staged_snapshot_value
            .ok_or_else(|| Error::Failed("apply_snapshot before save_logical_snp_obj".into()))?;
        inner.value = staged;
        inner.last_commit_index = snapshot.last_log_idx;
        inner.staged_snapshot_value = None;
        Ok(true)
    }

    fn read_logical_snp_obj(
        &self,
        _snapshot: &SnapshotDescriptor,
        _ctx: &mut Option<SnpCtx>,
        obj_id: u64,
    ) -> Result<(Vec<u8>, bool)> {
        if obj_id == 0 {
            // Metadata object: nothing beyond the descriptor itself.
            Ok((Vec::new(), false))
        } else {
            let mut w = Writer::new();
            w.put_i64(self.value());
            Ok((w.into_bytes(), true))
        }
    }

    fn save_logical_snp_obj(
        &self,
        _snapshot: &SnapshotDescriptor,
        obj_id: &mut u64,
        data: &[u8],
        _is_first: bool,
        is_last: bool,
    ) -> Result<()> {
        if *obj_id == 0 {
            *obj_id = 1;
            return Ok(());
        }
        let mut r = Reader::new(data);
        let value = r.get_i64().map_err(|e| Error::Codec(e.to_string()))?;
        self.inner.lock().unwrap().staged_snapshot_value = Some(value);
        if is_last {
            *obj_id = 0;
        }
        Ok(())
    }

    fn last_snapshot(&self) -> Option<SnapshotDescriptor> {
        None
    }

    fn last_commit_index(&self) -> LogIndex {
        self.inner.lock().unwrap().last_commit_index
    }

    fn create_snapshot(&self, _snapshot: SnapshotDescriptor, done_cb: Box<dyn FnOnce(bool) + Send>) {
        done_cb(true);
    }
}

// ---------------------------------------------------------------------
// In-process channel transport
// ---------------------------------------------------------------------

type Inbox = Sender<(ReqMsg, Sender<RespMsg>)>;

/// Shared registry of "listening endpoints" for an in-process cluster.
/// Stands in for a real network for tests.
#[derive(Default)]
pub struct ChannelNetwork {
    inboxes: Mutex<HashMap<String, Inbox>>,
}

impl ChannelNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(ChannelNetwork::default())
    }
}

pub struct ChannelTransportFactory {
    network: Arc<ChannelNetwork>,
}

impl ChannelTransportFactory {
    pub fn new(network: Arc<ChannelNetwork>) -> Self {
        ChannelTransportFactory { network }
    }
}

impl RpcClientFactory for ChannelTransportFactory {
    fn create_client(&self, endpoint: &str) -> Result<Arc<dyn RpcClient>> {
        Ok(Arc::new(ChannelClient {
            endpoint: endpoint.to_string(),
            network: self.network.clone(),
        }))
    }
}

struct ChannelClient {
    endpoint: String,
    network: Arc<ChannelNetwork>,
}

impl RpcClient for ChannelClient {
    fn send(&self, req: ReqMsg, timeout_ms: u64) -> Result<RespMsg> {
        let inbox = {
            let inboxes = self.network.inboxes.lock().unwrap();
            inboxes.get(&self.endpoint).cloned()
        };
        let inbox = inbox.ok_or_else(|| Error::Failed(format!("no listener at {}", self.endpoint)))?;
        let (reply_tx, reply_rx) = channel();
        inbox
            .send((req, reply_tx))
            .map_err(|_| Error::Failed("peer inbox closed".into()))?;
        reply_rx
            .recv_timeout(Duration::from_millis(timeout_ms))
            .map_err(|_| Error::Timeout)
    }
}

/// An in-process [`RpcListener`] bound to one endpoint string in a shared
/// [`ChannelNetwork`].
pub struct ChannelListener {
    endpoint: String,
    network: Arc<ChannelNetwork>,
    rx: Mutex<Option<Receiver<(ReqMsg, Sender<RespMsg>)>>>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelListener {
    pub fn new(endpoint: impl Into<String>, network: Arc<ChannelNetwork>) -> Arc<Self> {
        let endpoint = endpoint.into();
        let (tx, rx) = channel();
        network.inboxes.lock().unwrap().insert(endpoint.clone(), tx);
        Arc::new(ChannelListener {
            endpoint,
            network,
            rx: Mutex::new(Some(rx)),
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }
}

impl RpcListener for ChannelListener {
    fn listen(
        &self,
        handler: Arc<dyn Fn(ReqMsg) -> RespMsg + Send + Sync>,
    ) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Failed("listener already started".into()))?;
        let stop = self.stop.clone();
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok((req, reply_tx)) => {
                        let resp = handler(req);
                        let _ = reply_tx.send(resp);
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.network.inboxes.lock().unwrap().remove(&self.endpoint);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::ValueType;

    #[test]
    fn memory_log_store_append_and_term_at() {
        let log = MemoryLogStore::new();
        log.append(LogEntry::new(1, ValueType::AppLog, vec![]));
        log.append(LogEntry::new(2, ValueType::AppLog, vec![]));
        assert_eq!(log.next_slot(), 3);
        assert_eq!(log.term_at(1), 1);
        assert_eq!(log.term_at(2), 2);
        assert_eq!(log.term_at(0), 0);
    }

    #[test]
    fn memory_log_store_compact_raises_start_index() {
        let log = MemoryLogStore::new();
        for t in 1..=5 {
            log.append(LogEntry::new(t, ValueType::AppLog, vec![]));
        }
        assert!(log.compact(3));
        assert_eq!(log.start_index(), 4);
        assert!(log.entry_at(3).is_none());
        assert_eq!(log.entry_at(4).unwrap().term, 4);
    }

    #[test]
    fn calculator_applies_ops_in_order() {
        let calc = CalculatorStateMachine::new();
        calc.commit(1, &encode_calc_op(CalcOp::Add, 3)).unwrap();
        calc.commit(2, &encode_calc_op(CalcOp::Add, 5)).unwrap();
        assert_eq!(calc.value(), 8);
        assert_eq!(calc.last_commit_index(), 2);
    }

    #[test]
    fn calculator_rejects_division_by_zero() {
        let calc = CalculatorStateMachine::new();
        assert!(calc.commit(1, &encode_calc_op(CalcOp::Div, 0)).is_err());
    }

    #[test]
    fn channel_transport_roundtrips_a_request() {
        use crate::message::{ReqPayload, RespPayload};

        let network = ChannelNetwork::new();
        let listener = ChannelListener::new("node-a", network.clone());
        listener
            .listen(Arc::new(|req: ReqMsg| RespMsg {
                term: req.term,
                src: req.dst,
                dst: req.src,
                last_log_idx: 0,
                last_log_term: 0,
                accepted: true,
                next_idx: None,
                payload: RespPayload::AppendEntries { conflict_hint: None },
            }))
            .unwrap();

        let factory = ChannelTransportFactory::new(network);
        let client = factory.create_client("node-a").unwrap();
        let req = ReqMsg {
            term: 1,
            src: 2,
            dst: 1,
            last_log_idx: 0,
            last_log_term: 0,
            commit_idx: 0,
            payload: ReqPayload::AppendEntries { entries: vec![] },
        };
        let resp = client.send(req, 1000).unwrap();
        assert!(resp.accepted);
        listener.stop();
    }
}

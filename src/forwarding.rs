//! Auto-forward layer (C10, spec §4.8).
//!
//! A bounded pool of RPC clients keyed by leader id. Blocking mode waits
//! on a per-leader condition variable with a timeout; async mode queues
//! `{req, promise}` pairs and drains them FIFO as clients free up (P7).

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::message::{ReqMsg, RespMsg};
use crate::traits::{RpcClient, RpcClientFactory};
use crate::types::ServerId;

struct LeaderPool {
    idle: Vec<Arc<dyn RpcClient>>,
    in_use: usize,
    /// Async-mode queue of requests waiting for a client to free up.
    waiters: VecDeque<(ReqMsg, Sender<Result<RespMsg>>)>,
}

impl LeaderPool {
    fn new() -> Self {
        LeaderPool {
            idle: Vec::new(),
            in_use: 0,
            waiters: VecDeque::new(),
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.in_use
    }
}

/// Per-leader-id bounded client pool (spec §4.8). One instance serves
/// the whole auto-forward layer; `leaders` is keyed by the current
/// leader's server id so a leadership change simply grows a new entry
/// rather than requiring a flush.
pub struct ForwardPool {
    factory: Arc<dyn RpcClientFactory>,
    max_connections: usize,
    req_timeout_ms: u64,
    leaders: Mutex<HashMap<ServerId, LeaderPool>>,
    cv: Condvar,
    shutdown: Mutex<bool>,
}

impl ForwardPool {
    pub fn new(factory: Arc<dyn RpcClientFactory>, max_connections: usize, req_timeout_ms: u64) -> Self {
        ForwardPool {
            factory,
            max_connections,
            req_timeout_ms,
            leaders: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            shutdown: Mutex::new(false),
        }
    }

    fn acquire_or_wait(&self, leader_id: ServerId, leader_endpoint: &str) -> Result<Arc<dyn RpcClient>> {
        let deadline = Instant::now() + Duration::from_millis(self.req_timeout_ms);
        let mut leaders = self.leaders.lock().unwrap();
        loop {
            if *self.shutdown.lock().unwrap() {
                return Err(Error::Cancelled("auto-forward pool shut down"));
            }
            let pool = leaders.entry(leader_id).or_insert_with(LeaderPool::new);
            if let Some(client) = pool.idle.pop() {
                if !client.is_abandoned() {
                    pool.in_use += 1;
                    return Ok(client);
                }
                continue;
            }
            if pool.total() < self.max_connections {
                let client = self.factory.create_client(leader_endpoint)?;
                pool.in_use += 1;
                return Ok(client);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, timeout_result) = self
                .cv
                .wait_timeout(leaders, deadline - now)
                .map_err(|_| Error::Failed("forward pool lock poisoned".into()))?;
            leaders = guard;
            if timeout_result.timed_out() {
                return Err(Error::Timeout);
            }
        }
    }

    fn release(&self, leader_id: ServerId, client: Arc<dyn RpcClient>) {
        let mut leaders = self.leaders.lock().unwrap();
        let pool = leaders.entry(leader_id).or_insert_with(LeaderPool::new);
        pool.in_use = pool.in_use.saturating_sub(1);

        if let Some((req, reply)) = pool.waiters.pop_front() {
            // Hand this client straight to the oldest queued async request (FIFO, P7).
            pool.in_use += 1;
            drop(leaders);
            let outcome = client.send(req, self.req_timeout_ms);
            let _ = reply.send(outcome);
            self.release(leader_id, client);
            return;
        }

        pool.idle.push(client);
        drop(leaders);
        self.cv.notify_all();
    }

    /// Blocking-mode forward: waits for a client, sends, returns the
    /// client to the pool either way.
    pub fn forward_blocking(&self, leader_id: ServerId, leader_endpoint: &str, req: ReqMsg) -> Result<RespMsg> {
        let client = self.acquire_or_wait(leader_id, leader_endpoint)?;
        let outcome = client.send(req, self.req_timeout_ms);
        self.release(leader_id, client);
        outcome
    }

    /// Async-mode forward: returns immediately with a receiver that
    /// resolves once a client is available and the RPC completes (or the
    /// request is queued because the pool is at capacity).
    pub fn forward_async(&self, leader_id: ServerId, leader_endpoint: &str, req: ReqMsg) -> Receiver<Result<RespMsg>> {
        let (tx, rx) = channel();
        let mut leaders = self.leaders.lock().unwrap();
        if *self.shutdown.lock().unwrap() {
            let _ = tx.send(Err(Error::Cancelled("auto-forward pool shut down")));
            return rx;
        }
        let pool = leaders.entry(leader_id).or_insert_with(LeaderPool::new);
        if let Some(client) = pool.idle.pop() {
            pool.in_use += 1;
            drop(leaders);
            let outcome = client.send(req, self.req_timeout_ms);
            let _ = tx.send(outcome);
            self.release(leader_id, client);
            return rx;
        }
        if pool.total() < self.max_connections {
            match self.factory.create_client(leader_endpoint) {
                Ok(client) => {
                    pool.in_use += 1;
                    drop(leaders);
                    let outcome = client.send(req, self.req_timeout_ms);
                    let _ = tx.send(outcome);
                    self.release(leader_id, client);
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
            return rx;
        }
        pool.waiters.push_back((req, tx));
        rx
    }

    /// Stops accepting new work and wakes every blocked waiter with a
    /// `Cancelled` error (spec §5, shutdown draining).
    pub fn shutdown(&self) {
        *self.shutdown.lock().unwrap() = true;
        let mut leaders = self.leaders.lock().unwrap();
        for pool in leaders.values_mut() {
            for (_, reply) in pool.waiters.drain(..) {
                let _ = reply.send(Err(Error::Cancelled("auto-forward pool shut down")));
            }
        }
        drop(leaders);
        self.cv.notify_all();
    }

    pub fn connection_count(&self, leader_id: ServerId) -> usize {
        self.leaders
            .lock()
            .unwrap()
            .get(&leader_id)
            .map(LeaderPool::total)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ReqPayload, RespPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct CountingClient {
        count: Arc<AtomicUsize>,
    }
    impl RpcClient for CountingClient {
        fn send(&self, req: ReqMsg, _timeout_ms: u64) -> Result<RespMsg> {
            self.count.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
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

    struct CountingFactory {
        created: Arc<AtomicUsize>,
        sends: Arc<AtomicUsize>,
    }
    impl RpcClientFactory for CountingFactory {
        fn create_client(&self, _endpoint: &str) -> Result<Arc<dyn RpcClient>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingClient { count: self.sends.clone() }))
        }
    }

    fn sample_req() -> ReqMsg {
        ReqMsg {
            term: 1,
            src: 9,
            dst: 1,
            last_log_idx: 0,
            last_log_term: 0,
            commit_idx: 0,
            payload: ReqPayload::AppendEntries { entries: vec![] },
        }
    }

    #[test]
    fn never_creates_more_than_max_connections() {
        let created = Arc::new(AtomicUsize::new(0));
        let sends = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory { created: created.clone(), sends });
        let pool = Arc::new(ForwardPool::new(factory, 1, 2_000));

        let p1 = pool.clone();
        let t1 = thread::spawn(move || p1.forward_blocking(1, "leader:1", sample_req()));
        let p2 = pool.clone();
        let t2 = thread::spawn(move || p2.forward_blocking(1, "leader:1", sample_req()));

        assert!(t1.join().unwrap().is_ok());
        assert!(t2.join().unwrap().is_ok());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn async_requests_drain_in_fifo_order() {
        let created = Arc::new(AtomicUsize::new(0));
        let sends = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory { created, sends });
        let pool = ForwardPool::new(factory, 1, 2_000);

        let first = pool.forward_async(1, "leader:1", sample_req());
        let second = pool.forward_async(1, "leader:1", sample_req());
        assert!(first.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert!(second.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
    }

    #[test]
    fn shutdown_cancels_queued_waiters() {
        let created = Arc::new(AtomicUsize::new(0));
        let sends = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory { created, sends });
        let pool = ForwardPool::new(factory, 1, 5_000);

        let _first = pool.forward_async(1, "leader:1", sample_req());
        let second = pool.forward_async(1, "leader:1", sample_req());
        pool.shutdown();
        match second.recv_timeout(Duration::from_secs(1)).unwrap() {
            Err(Error::Cancelled(_)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}

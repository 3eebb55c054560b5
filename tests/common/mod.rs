//! Shared harness for the end-to-end scenarios (spec.md §8): an
//! in-process cluster wired over `ChannelNetwork`, one `RaftServer` plus
//! `ChannelListener` per node, so tests exercise the same request path a
//! real deployment would use instead of calling orchestrator internals
//! directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use raft_engine::config::RaftConfig;
use raft_engine::fixtures::{
    CalculatorStateMachine, ChannelListener, ChannelNetwork, ChannelTransportFactory, MemoryLogStore,
    MemoryStateManager,
};
use raft_engine::message::codec::Reader;
use raft_engine::srv_config::{ClusterConfig, ClusterServer};
use raft_engine::types::ServerId;
use raft_engine::RaftServer;

/// Shortened timers so elections and heartbeats happen fast enough for
/// a test run, while still respecting `RaftConfig::validate`'s 10x rule.
pub fn fast_config() -> RaftConfig {
    let mut cfg = RaftConfig::default();
    cfg.election_min_ms = 80;
    cfg.election_max_ms = 160;
    cfg.heart_beat_interval_ms = 8;
    cfg.client_req_timeout_ms = 2_000;
    cfg.new_server_catch_up_timeout_ms = 2_000;
    cfg
}

pub fn endpoint(id: ServerId) -> String {
    format!("node-{id}")
}

pub fn cluster_config(ids: &[ServerId]) -> ClusterConfig {
    let mut cfg = ClusterConfig::new(0, 0);
    for &id in ids {
        cfg.upsert(ClusterServer::new(id, endpoint(id)));
    }
    cfg
}

pub fn decode_i64(bytes: &[u8]) -> i64 {
    let mut r = Reader::new(bytes);
    r.get_i64().expect("well-formed i64 payload")
}

/// One running node plus the externally-owned handles a test needs to
/// kill and later restart it against the same durable state.
pub struct Node {
    pub id: ServerId,
    pub server: Arc<RaftServer>,
    pub state_machine: Arc<CalculatorStateMachine>,
    pub state_manager: Arc<MemoryStateManager>,
    log: Arc<MemoryLogStore>,
    listener: Arc<ChannelListener>,
}

impl Node {
    fn spawn(
        id: ServerId,
        config: RaftConfig,
        log: Arc<MemoryLogStore>,
        state_machine: Arc<CalculatorStateMachine>,
        state_manager: Arc<MemoryStateManager>,
        network: Arc<ChannelNetwork>,
    ) -> Node {
        let factory = Arc::new(ChannelTransportFactory::new(network.clone()));
        let server = RaftServer::start(id, config, log.clone(), state_machine.clone(), state_manager.clone(), factory)
            .expect("server starts");
        let listener = ChannelListener::new(endpoint(id), network);
        let handler_server = server.clone();
        listener
            .listen(Arc::new(move |req| handler_server.handle_request(req)))
            .expect("listener starts");
        Node {
            id,
            server,
            state_machine,
            state_manager,
            log,
            listener,
        }
    }

    /// Stops the listener and background loop but keeps the log/state
    /// machine/state manager alive, so a later `Cluster::restart` picks
    /// up where this node left off (spec §8 scenario 2).
    pub fn kill(&self) {
        self.listener.stop();
        self.server.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct Cluster {
    pub nodes: Vec<Node>,
    network: Arc<ChannelNetwork>,
    config: RaftConfig,
}

impl Cluster {
    pub fn start(ids: &[ServerId]) -> Cluster {
        Self::start_with_config(ids, fast_config())
    }

    pub fn start_with_config(ids: &[ServerId], config: RaftConfig) -> Cluster {
        let network = ChannelNetwork::new();
        let initial_config = cluster_config(ids);
        let mut nodes = Vec::new();
        for &id in ids {
            let log = Arc::new(MemoryLogStore::new());
            let state_machine = Arc::new(CalculatorStateMachine::new());
            let state_manager = Arc::new(MemoryStateManager::new(id, initial_config.clone()));
            nodes.push(Node::spawn(id, config.clone(), log, state_machine, state_manager, network.clone()));
        }
        Cluster { nodes, network, config }
    }

    pub fn node(&self, id: ServerId) -> &Node {
        self.nodes.iter().find(|n| n.id == id).expect("node exists")
    }

    /// Polls until some node reports itself leader, or panics after
    /// `timeout`.
    pub fn wait_for_leader(&self, timeout: Duration) -> &Node {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.nodes.iter().find(|n| n.server.is_leader()) {
                return leader;
            }
            if Instant::now() >= deadline {
                panic!("no leader elected within {timeout:?}");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Spawns a brand-new node wired onto this cluster's network but not
    /// yet tracked in `nodes` — the caller drives it into the cluster via
    /// `add_srv` (spec §8 scenario 6).
    pub fn spawn_joiner(&self, id: ServerId) -> Node {
        let log = Arc::new(MemoryLogStore::new());
        let state_machine = Arc::new(CalculatorStateMachine::new());
        let state_manager = Arc::new(MemoryStateManager::new(id, cluster_config(&[id])));
        Node::spawn(id, self.config.clone(), log, state_machine, state_manager, self.network.clone())
    }

    /// Restarts a previously-killed node, reusing its log/state-machine/
    /// state-manager to simulate a process restart against durable
    /// storage that survived the crash.
    pub fn restart(&mut self, id: ServerId) {
        let idx = self.nodes.iter().position(|n| n.id == id).expect("node exists");
        let (log, state_machine, state_manager) = {
            let old = &self.nodes[idx];
            (old.log.clone(), old.state_machine.clone(), old.state_manager.clone())
        };
        let node = Node::spawn(id, self.config.clone(), log, state_machine, state_manager, self.network.clone());
        self.nodes[idx] = node;
    }
}

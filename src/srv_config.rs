//! Cluster membership descriptors.
//!
//! Grounded on `examples/original_source/include/libnuraft/srv_config.hxx`
//! and `src/srv_config.cxx`: same fields, same wire layout, same default
//! priority.

use crate::message::codec::{Reader, WireCodec, Writer};
use crate::types::{LogIndex, ServerId};

/// Default priority assigned to a newly constructed descriptor.
pub const INIT_PRIORITY: i32 = 1;

/// A priority of 0 means this server will never become a leader.
pub const INELIGIBLE_PRIORITY: i32 = 0;

/// One server's membership descriptor: identity, location, and
/// leadership eligibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterServer {
    pub id: ServerId,
    pub dc_id: i32,
    pub endpoint: String,
    pub aux: String,
    pub learner: bool,
    pub priority: i32,
}

impl ClusterServer {
    pub fn new(id: ServerId, endpoint: impl Into<String>) -> Self {
        ClusterServer {
            id,
            dc_id: 0,
            endpoint: endpoint.into(),
            aux: String::new(),
            learner: false,
            priority: INIT_PRIORITY,
        }
    }

    pub fn learner(mut self, learner: bool) -> Self {
        self.learner = learner;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn dc_id(mut self, dc_id: i32) -> Self {
        self.dc_id = dc_id;
        self
    }

    pub fn aux(mut self, aux: impl Into<String>) -> Self {
        self.aux = aux.into();
        self
    }

    /// Priority-0 servers never start an election (spec §4.3).
    pub fn is_voting_eligible(&self) -> bool {
        !self.learner && self.priority > INELIGIBLE_PRIORITY
    }
}

impl WireCodec for ClusterServer {
    fn encode(&self, w: &mut Writer) {
        w.put_i32(self.id);
        w.put_i32(self.dc_id);
        w.put_cstr(&self.endpoint);
        w.put_cstr(&self.aux);
        w.put_bool(self.learner);
        w.put_i32(self.priority);
    }

    fn decode(r: &mut Reader) -> crate::error::Result<Self> {
        let id = r.get_i32()?;
        let dc_id = r.get_i32()?;
        let endpoint = r.get_cstr()?;
        let aux = r.get_cstr()?;
        let learner = r.get_bool()?;
        let priority = r.get_i32()?;
        Ok(ClusterServer {
            id,
            dc_id,
            endpoint,
            aux,
            learner,
            priority,
        })
    }
}

/// The cluster's membership at a point in the log.
///
/// `log_idx` is the log position at which this config was committed;
/// `prev_log_idx` is the previous config's `log_idx`. Configs replace
/// older ones monotonically by `log_idx` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub log_idx: LogIndex,
    pub prev_log_idx: LogIndex,
    servers: Vec<ClusterServer>,
}

impl ClusterConfig {
    pub fn new(log_idx: LogIndex, prev_log_idx: LogIndex) -> Self {
        ClusterConfig {
            log_idx,
            prev_log_idx,
            servers: Vec::new(),
        }
    }

    pub fn with_servers(
        log_idx: LogIndex,
        prev_log_idx: LogIndex,
        servers: Vec<ClusterServer>,
    ) -> Self {
        ClusterConfig {
            log_idx,
            prev_log_idx,
            servers,
        }
    }

    pub fn get_servers(&self) -> &[ClusterServer] {
        &self.servers
    }

    pub fn get_server(&self, id: ServerId) -> Option<&ClusterServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.get_server(id).is_some()
    }

    /// Number of voting (non-learner) members. Used as the quorum base.
    pub fn voting_member_count(&self) -> usize {
        self.servers.iter().filter(|s| !s.learner).count()
    }

    /// `ceil((N_voters + 1) / 2)`, excluding learners (spec §4.3).
    pub fn quorum_size(&self) -> usize {
        (self.voting_member_count() + 2) / 2
    }

    pub fn upsert(&mut self, server: ClusterServer) {
        if let Some(slot) = self.servers.iter_mut().find(|s| s.id == server.id) {
            *slot = server;
        } else {
            self.servers.push(server);
        }
    }

    pub fn remove(&mut self, id: ServerId) -> Option<ClusterServer> {
        let idx = self.servers.iter().position(|s| s.id == id)?;
        Some(self.servers.remove(idx))
    }

    /// Produce the next config (one log index later) with `f` applied.
    pub fn next(&self, new_log_idx: LogIndex, f: impl FnOnce(&mut Vec<ClusterServer>)) -> Self {
        let mut servers = self.servers.clone();
        f(&mut servers);
        ClusterConfig {
            log_idx: new_log_idx,
            prev_log_idx: self.log_idx,
            servers,
        }
    }
}

impl WireCodec for ClusterConfig {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.log_idx);
        w.put_u64(self.prev_log_idx);
        w.put_u32(self.servers.len() as u32);
        for s in &self.servers {
            let bytes = s.to_bytes();
            w.put_bytes(&bytes);
        }
    }

    fn decode(r: &mut Reader) -> crate::error::Result<Self> {
        let log_idx = r.get_u64()?;
        let prev_log_idx = r.get_u64()?;
        let count = r.get_u32()?;
        let mut servers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let bytes = r.get_bytes()?;
            servers.push(ClusterServer::from_bytes(&bytes)?);
        }
        Ok(ClusterConfig {
            log_idx,
            prev_log_idx,
            servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_descriptor_roundtrips() {
        // Scenario 3 from spec §8.
        let s = ClusterServer {
            id: 42,
            dc_id: 0,
            endpoint: "host:9000".into(),
            aux: "".into(),
            learner: false,
            priority: 1,
        };
        let bytes = s.to_bytes();
        let back = ClusterServer::from_bytes(&bytes).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn cluster_config_roundtrips() {
        let mut cfg = ClusterConfig::new(5, 0);
        cfg.upsert(ClusterServer::new(1, "a:1"));
        cfg.upsert(ClusterServer::new(2, "b:2").learner(true));
        let bytes = cfg.to_bytes();
        let back = ClusterConfig::from_bytes(&bytes).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn quorum_size_excludes_learners() {
        let mut cfg = ClusterConfig::new(0, 0);
        cfg.upsert(ClusterServer::new(1, "a"));
        cfg.upsert(ClusterServer::new(2, "b"));
        cfg.upsert(ClusterServer::new(3, "c"));
        cfg.upsert(ClusterServer::new(4, "d").learner(true));
        assert_eq!(cfg.voting_member_count(), 3);
        assert_eq!(cfg.quorum_size(), 2);
    }

    #[test]
    fn priority_zero_is_ineligible() {
        let s = ClusterServer::new(1, "a").priority(0);
        assert!(!s.is_voting_eligible());
    }
}

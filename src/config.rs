//! Engine configuration (spec §6, expanded in SPEC_FULL.md §4.12).

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub election_min_ms: u64,
    pub election_max_ms: u64,
    pub heart_beat_interval_ms: u64,
    pub rpc_failure_backoff_ms: u64,
    pub log_sync_stop_gap: u64,
    pub snapshot_distance: u64,
    pub max_append_size: u64,
    pub reserved_log_items: u64,
    pub client_req_timeout_ms: u64,
    pub auto_forwarding: bool,
    pub auto_forwarding_max_connections: u32,
    pub auto_forwarding_req_timeout_ms: u64,
    pub parallel_log_appending: bool,
    pub enable_randomized_hb: bool,
    pub priority_step_down_ms: u64,
    /// New-server catch-up deadline before `add_srv` aborts (spec §4.6).
    pub new_server_catch_up_timeout_ms: u64,
}

impl Default for RaftConfig {
    /// Matches NuRaft's own defaults where the original source states them.
    fn default() -> Self {
        RaftConfig {
            election_min_ms: 200,
            election_max_ms: 400,
            heart_beat_interval_ms: 20,
            rpc_failure_backoff_ms: 50,
            log_sync_stop_gap: 100,
            snapshot_distance: 0,
            max_append_size: 256,
            reserved_log_items: 5,
            client_req_timeout_ms: 3_000,
            auto_forwarding: false,
            auto_forwarding_max_connections: 10,
            auto_forwarding_req_timeout_ms: 3_000,
            parallel_log_appending: false,
            enable_randomized_hb: false,
            priority_step_down_ms: 2_000,
            new_server_catch_up_timeout_ms: 5_000,
        }
    }
}

impl RaftConfig {
    /// Sanity checks the engine refuses to start without (spec §4.2, §4.12).
    pub fn validate(&self) -> Result<()> {
        if self.election_min_ms >= self.election_max_ms {
            return Err(Error::BadRequest(format!(
                "election_min_ms ({}) must be < election_max_ms ({})",
                self.election_min_ms, self.election_max_ms
            )));
        }
        if 10 * self.heart_beat_interval_ms > self.election_min_ms {
            return Err(Error::BadRequest(format!(
                "10 * heart_beat_interval_ms ({}) must be <= election_min_ms ({})",
                10 * self.heart_beat_interval_ms,
                self.election_min_ms
            )));
        }
        if self.auto_forwarding && self.auto_forwarding_max_connections == 0 {
            return Err(Error::BadRequest(
                "auto_forwarding_max_connections must be >= 1 when auto_forwarding is enabled"
                    .into(),
            ));
        }
        if self.max_append_size == 0 {
            return Err(Error::BadRequest("max_append_size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RaftConfig::default().validate().unwrap();
    }

    #[test]
    fn heartbeat_too_slow_is_rejected() {
        let mut cfg = RaftConfig::default();
        cfg.heart_beat_interval_ms = cfg.election_min_ms; // 10x violated
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_election_range_is_rejected() {
        let mut cfg = RaftConfig::default();
        cfg.election_min_ms = 500;
        cfg.election_max_ms = 400;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auto_forwarding_needs_at_least_one_connection() {
        let mut cfg = RaftConfig::default();
        cfg.auto_forwarding = true;
        cfg.auto_forwarding_max_connections = 0;
        assert!(cfg.validate().is_err());
    }
}

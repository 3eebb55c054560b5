//! Membership module (C8, spec §4.6).
//!
//! Single-server changes only — no joint consensus. Pure decision logic;
//! the orchestrator owns the actual config-entry append and peer
//! teardown/bringup.

use crate::error::{Error, Result};
use crate::message::codec::WireCodec;
use crate::srv_config::{ClusterConfig, ClusterServer};
use crate::types::{LogIndex, ServerId};

/// A membership change payload, stored as a `ValueType::ClusterServer`
/// log entry. Grounded on NuRaft's own single-entry-per-change encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(ClusterServer),
    Remove(ServerId),
}

impl MembershipChange {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = crate::message::codec::Writer::new();
        match self {
            MembershipChange::Add(server) => {
                w.put_u8(0);
                w.put_bytes(&server.to_bytes());
            }
            MembershipChange::Remove(id) => {
                w.put_u8(1);
                w.put_i32(*id);
            }
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = crate::message::codec::Reader::new(bytes);
        match r.get_u8()? {
            0 => {
                let server = ClusterServer::from_bytes(&r.get_bytes()?)?;
                Ok(MembershipChange::Add(server))
            }
            1 => Ok(MembershipChange::Remove(r.get_i32()?)),
            other => Err(Error::Codec(format!("unknown membership change tag {other}"))),
        }
    }

    /// Applies this change to produce the next config, one log index
    /// later (spec §3's monotonic `log_idx`/`prev_log_idx` chain).
    pub fn apply_to(&self, current: &ClusterConfig, new_log_idx: LogIndex) -> Result<ClusterConfig> {
        match self {
            MembershipChange::Add(server) => {
                if current.contains(server.id) {
                    return Err(Error::ServerAlreadyExists(server.id));
                }
                let server = server.clone();
                Ok(current.next(new_log_idx, move |servers| servers.push(server)))
            }
            MembershipChange::Remove(id) => {
                if !current.contains(*id) {
                    return Err(Error::ServerNotFound(*id));
                }
                let id = *id;
                Ok(current.next(new_log_idx, move |servers| servers.retain(|s| s.id != id)))
            }
        }
    }
}

/// Whether a learner has caught up closely enough to be promoted
/// (spec §4.6 step 2): `matched_idx[S] >= last_log_idx - sync_threshold`.
pub fn learner_caught_up(matched_idx: LogIndex, leader_last_log_idx: LogIndex, sync_threshold: LogIndex) -> bool {
    matched_idx + sync_threshold >= leader_last_log_idx
}

/// Tracks one in-flight `add_srv` catch-up round so the orchestrator can
/// decide, on each AppendEntries response, whether to promote, keep
/// waiting, or abort.
pub struct CatchUpTracker {
    pub server_id: ServerId,
    pub started_at: std::time::Instant,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpOutcome {
    StillCatchingUp,
    ReadyToPromote,
    TimedOut,
}

impl CatchUpTracker {
    pub fn new(server_id: ServerId, timeout_ms: u64) -> Self {
        CatchUpTracker {
            server_id,
            started_at: std::time::Instant::now(),
            timeout_ms,
        }
    }

    pub fn poll(&self, matched_idx: LogIndex, leader_last_log_idx: LogIndex, sync_threshold: LogIndex) -> CatchUpOutcome {
        if learner_caught_up(matched_idx, leader_last_log_idx, sync_threshold) {
            return CatchUpOutcome::ReadyToPromote;
        }
        if self.started_at.elapsed().as_millis() as u64 >= self.timeout_ms {
            return CatchUpOutcome::TimedOut;
        }
        CatchUpOutcome::StillCatchingUp
    }
}

/// Leadership transfer state machine (spec §4.6): the leader pauses new
/// writes, waits for the target to fully match, sends the forced
/// notification, then steps down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    WaitingForTargetToMatch,
    ReadyToSendTakeover,
    Completed,
    Aborted,
}

pub fn advance_leadership_transfer(
    target_matched_idx: LogIndex,
    leader_last_log_idx: LogIndex,
    takeover_sent: bool,
    election_timeout_elapsed: bool,
    target_won: bool,
) -> TransferState {
    if target_won {
        return TransferState::Completed;
    }
    if takeover_sent {
        return if election_timeout_elapsed {
            TransferState::Aborted
        } else {
            TransferState::ReadyToSendTakeover
        };
    }
    if target_matched_idx >= leader_last_log_idx {
        TransferState::ReadyToSendTakeover
    } else {
        TransferState::WaitingForTargetToMatch
    }
}

/// Picks the best leadership-transfer target among up-to-date voting
/// peers: highest priority, ties broken by highest matched index.
pub fn pick_transfer_target<'a>(
    candidates: impl Iterator<Item = (&'a ClusterServer, LogIndex)>,
) -> Option<ServerId> {
    candidates
        .filter(|(s, _)| s.is_voting_eligible())
        .max_by_key(|(s, matched)| (s.priority, *matched))
        .map(|(s, _)| s.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicate_id() {
        let mut cfg = ClusterConfig::new(1, 0);
        cfg.upsert(ClusterServer::new(1, "a"));
        let change = MembershipChange::Add(ClusterServer::new(1, "a2"));
        assert!(matches!(change.apply_to(&cfg, 2), Err(Error::ServerAlreadyExists(1))));
    }

    #[test]
    fn remove_rejects_unknown_id() {
        let cfg = ClusterConfig::new(1, 0);
        let change = MembershipChange::Remove(9);
        assert!(matches!(change.apply_to(&cfg, 2), Err(Error::ServerNotFound(9))));
    }

    #[test]
    fn add_then_remove_round_trips_through_config_chain() {
        let cfg = ClusterConfig::new(1, 0);
        let added = MembershipChange::Add(ClusterServer::new(2, "h:2"))
            .apply_to(&cfg, 2)
            .unwrap();
        assert!(added.contains(2));
        assert_eq!(added.prev_log_idx, 1);

        let removed = MembershipChange::Remove(2).apply_to(&added, 3).unwrap();
        assert!(!removed.contains(2));
    }

    #[test]
    fn membership_change_wire_roundtrips() {
        let add = MembershipChange::Add(ClusterServer::new(7, "x:1"));
        assert_eq!(MembershipChange::decode(&add.encode()).unwrap(), add);
        let remove = MembershipChange::Remove(7);
        assert_eq!(MembershipChange::decode(&remove.encode()).unwrap(), remove);
    }

    #[test]
    fn catch_up_tracker_reports_ready_once_close_enough() {
        let tracker = CatchUpTracker::new(2, 5_000);
        assert_eq!(tracker.poll(95, 100, 5), CatchUpOutcome::ReadyToPromote);
        assert_eq!(tracker.poll(50, 100, 5), CatchUpOutcome::StillCatchingUp);
    }

    #[test]
    fn leadership_transfer_progresses_through_states() {
        assert_eq!(
            advance_leadership_transfer(50, 100, false, false, false),
            TransferState::WaitingForTargetToMatch
        );
        assert_eq!(
            advance_leadership_transfer(100, 100, false, false, false),
            TransferState::ReadyToSendTakeover
        );
        assert_eq!(
            advance_leadership_transfer(100, 100, true, true, false),
            TransferState::Aborted
        );
        assert_eq!(
            advance_leadership_transfer(100, 100, true, false, true),
            TransferState::Completed
        );
    }

    #[test]
    fn transfer_target_prefers_highest_priority_then_match_index() {
        let a = ClusterServer::new(1, "a").priority(5);
        let b = ClusterServer::new(2, "b").priority(9);
        let target = pick_transfer_target(vec![(&a, 10), (&b, 3)].into_iter());
        assert_eq!(target, Some(2));
    }
}

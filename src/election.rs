//! Election module (C5, spec §4.3).
//!
//! Pure decision functions, kept free of locks/threads/IO so the safety
//! rules (invariants I1/I2) can be unit tested directly.

use crate::types::{LogIndex, ServerId, Term};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

/// Compares `(term, index)` lexicographically, per spec §4.3's
/// up-to-date rule.
pub fn log_is_up_to_date(
    candidate_last_term: Term,
    candidate_last_idx: LogIndex,
    voter_last_term: Term,
    voter_last_idx: LogIndex,
) -> bool {
    (candidate_last_term, candidate_last_idx) >= (voter_last_term, voter_last_idx)
}

/// `ceil((n_voters + 1) / 2)`.
pub fn quorum_size(n_voters: usize) -> usize {
    (n_voters + 2) / 2
}

/// Decides whether to grant a pre-vote. Does not mutate `current_term` or
/// `voted_for` — pre-vote is a dry run (spec §4.3).
pub struct PreVoteInput {
    pub heard_from_leader_recently: bool,
    pub candidate_last_term: Term,
    pub candidate_last_idx: LogIndex,
    pub voter_last_term: Term,
    pub voter_last_idx: LogIndex,
}

pub fn grant_pre_vote(input: &PreVoteInput) -> bool {
    !input.heard_from_leader_recently
        && log_is_up_to_date(
            input.candidate_last_term,
            input.candidate_last_idx,
            input.voter_last_term,
            input.voter_last_idx,
        )
}

/// Decides whether to grant a real vote. The caller persists the decision
/// (`voted_for`) before replying (invariant I2); this function only
/// computes the decision.
pub struct RealVoteInput {
    pub term: Term,
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub candidate_id: ServerId,
    pub candidate_last_term: Term,
    pub candidate_last_idx: LogIndex,
    pub voter_last_term: Term,
    pub voter_last_idx: LogIndex,
}

pub fn grant_real_vote(input: &RealVoteInput) -> bool {
    if input.term != input.current_term {
        return false;
    }
    let not_yet_voted = input.voted_for.is_none() || input.voted_for == Some(input.candidate_id);
    not_yet_voted
        && log_is_up_to_date(
            input.candidate_last_term,
            input.candidate_last_idx,
            input.voter_last_term,
            input.voter_last_idx,
        )
}

/// Accumulates vote responses for one election round.
pub struct VoteTally {
    term: Term,
    quorum: usize,
    granted: usize,
}

impl VoteTally {
    /// A candidate always votes for itself.
    pub fn new(term: Term, quorum: usize) -> Self {
        VoteTally {
            term,
            quorum,
            granted: 1,
        }
    }

    /// Returns `true` the moment quorum is first reached.
    pub fn record(&mut self, resp_term: Term, granted: bool) -> bool {
        if granted && resp_term == self.term {
            self.granted += 1;
        }
        self.has_quorum()
    }

    pub fn has_quorum(&self) -> bool {
        self.granted >= self.quorum
    }
}

/// Priority gating (spec §4.3): priority-0 servers never start an
/// election. Servers below the current leader's effective priority must
/// wait out a monotonic decay window before contesting, unless forced.
///
/// `effective_priority` decays linearly from the configured priority down
/// to 0 over `priority_step_down_ms`, so any positive-priority server is
/// eventually allowed to contest if it hears nothing from a leader for
/// long enough — matching the "do not guess a precise curve" guidance.
pub fn may_start_election(
    my_priority: i32,
    leader_priority: i32,
    time_since_leader_contact: Duration,
    priority_step_down_ms: u64,
    forced: bool,
) -> bool {
    if my_priority <= 0 {
        return false;
    }
    if forced {
        return true;
    }
    if my_priority >= leader_priority {
        return true;
    }
    if priority_step_down_ms == 0 {
        return true;
    }
    let elapsed_ms = time_since_leader_contact.as_millis() as u64;
    let decay_fraction = (elapsed_ms as f64 / priority_step_down_ms as f64).min(1.0);
    let effective_threshold = leader_priority as f64 * (1.0 - decay_fraction);
    (my_priority as f64) >= effective_threshold
}

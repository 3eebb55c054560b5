//! Replication module (C6, spec §4.4).
//!
//! Pure functions for the AppendEntries construction/application math and
//! commit-index advancement, kept separate from the peer threads and
//! locks that drive them so the safety-critical arithmetic is directly
//! testable.

use crate::log_entry::LogEntry;
use crate::traits::LogStore;
use crate::types::{LogIndex, Term};

/// What the leader needs in order to build one `AppendEntries` for a peer.
pub struct AppendEntriesPlan {
    pub prev_log_idx: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    /// `true` if the peer's required `prev_log_idx` lies below the log's
    /// retained start — the caller must switch this peer to snapshot
    /// transfer instead (spec §4.4).
    pub needs_snapshot: bool,
}

/// Builds the next `AppendEntries` for a peer whose next expected index is
/// `next_idx`.
pub fn plan_append_entries(
    log: &dyn LogStore,
    next_idx: LogIndex,
    max_append_size: u64,
    batch_size_hint_in_bytes: Option<i64>,
) -> AppendEntriesPlan {
    let prev_log_idx = next_idx.saturating_sub(1);
    if prev_log_idx > 0 && prev_log_idx < log.start_index() {
        return AppendEntriesPlan {
            prev_log_idx,
            prev_log_term: 0,
            entries: Vec::new(),
            needs_snapshot: true,
        };
    }
    let prev_log_term = log.term_at(prev_log_idx);
    let last = log.next_slot();
    let end = (next_idx + max_append_size).min(last);
    let entries = if next_idx < end {
        log.log_entries_ext(next_idx, end, batch_size_hint_in_bytes)
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    AppendEntriesPlan {
        prev_log_idx,
        prev_log_term,
        entries,
        needs_snapshot: false,
    }
}

/// Result of a follower applying one `AppendEntries` request.
pub struct FollowerApplyResult {
    pub success: bool,
    pub last_new_index: LogIndex,
    /// First index of the follower's last divergent term, present only on
    /// rejection due to a log mismatch (spec §4.4).
    pub conflict_hint: Option<LogIndex>,
}

/// Applies a replicated batch to the follower's log. Returns the outcome
/// without mutating `commit_idx` — the caller does that from
/// `last_new_index` and `leader_commit` per spec §4.4.
pub fn follower_apply_append_entries(
    log: &dyn LogStore,
    prev_log_idx: LogIndex,
    prev_log_term: Term,
    entries: Vec<LogEntry>,
) -> FollowerApplyResult {
    if prev_log_idx > 0 {
        let local_term = log.term_at(prev_log_idx);
        if prev_log_idx >= log.next_slot() || local_term != prev_log_term {
            return FollowerApplyResult {
                success: false,
                last_new_index: prev_log_idx,
                conflict_hint: Some(first_index_of_divergent_term(log, prev_log_idx)),
            };
        }
    }

    let mut idx = prev_log_idx;
    for entry in entries {
        idx += 1;
        let existing_term = if idx < log.next_slot() {
            Some(log.term_at(idx))
        } else {
            None
        };
        match existing_term {
            Some(t) if t == entry.term => {
                // Already have this entry; nothing to do (idempotent replay).
            }
            Some(_) => {
                // Conflict: truncate the suffix starting here and append fresh.
                log.write_at(idx, entry);
            }
            None => {
                let appended = log.append(entry);
                debug_assert_eq!(appended, idx);
            }
        }
    }
    log.end_of_append_batch(prev_log_idx + 1, idx.saturating_sub(prev_log_idx));

    FollowerApplyResult {
        success: true,
        last_new_index: idx,
        conflict_hint: None,
    }
}

/// Walks backward from `from_idx` to find the first index of the term that
/// entry carries, so the leader can skip straight past an entire
/// divergent term on its next attempt rather than retrying one index at a
/// time.
fn first_index_of_divergent_term(log: &dyn LogStore, from_idx: LogIndex) -> LogIndex {
    let term = log.term_at(from_idx.min(log.next_slot().saturating_sub(1)));
    if term == 0 {
        return log.start_index();
    }
    let mut idx = from_idx.min(log.next_slot().saturating_sub(1));
    while idx > log.start_index() && log.term_at(idx - 1) == term {
        idx -= 1;
    }
    idx
}

/// `commit_idx := min(leader_commit, last_new_index)` per spec §4.4.
pub fn follower_commit_index(current: LogIndex, leader_commit: LogIndex, last_new_index: LogIndex) -> LogIndex {
    current.max(leader_commit.min(last_new_index))
}

/// Leader-side commit-index advancement (spec §4.4): sort `matched`
/// (which must already include the leader's own last_log_idx) descending
/// and take the `quorum`-th highest. The caller is responsible for only
/// committing if the entry at that index belongs to the current term
/// (Raft's no-commit-across-terms safety rule) — that check needs the log,
/// so it isn't duplicated here.
pub fn quorum_commit_index(matched: &[LogIndex], quorum: usize) -> LogIndex {
    if matched.is_empty() || quorum == 0 || quorum > matched.len() {
        return 0;
    }
    let mut sorted = matched.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted[quorum - 1]
}

/// Clamps a state-machine-adjusted commit index to never exceed the
/// quorum-computed one (spec §9's open question, resolved: clamp down
/// only, never up).
pub fn clamp_adjusted_commit_index(adjusted: LogIndex, quorum_idx: LogIndex) -> LogIndex {
    adjusted.min(quorum_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::MemoryLogStore;
    use crate::log_entry::ValueType;

    fn entry(term: Term) -> LogEntry {
        LogEntry::new(term, ValueType::AppLog, vec![1])
    }

    #[test]
    fn quorum_commit_index_matches_spec_example() {
        // 3-node cluster, matched_idx for leader+2 followers.
        assert_eq!(quorum_commit_index(&[5, 5, 3], 2), 5);
        assert_eq!(quorum_commit_index(&[5, 2, 2], 2), 2);
    }

    #[test]
    fn clamp_never_raises_above_quorum() {
        assert_eq!(clamp_adjusted_commit_index(10, 5), 5);
        assert_eq!(clamp_adjusted_commit_index(3, 5), 3);
    }

    #[test]
    fn follower_accepts_matching_prev_and_appends() {
        let log = MemoryLogStore::new();
        log.append(entry(1));
        log.append(entry(1));
        let result = follower_apply_append_entries(&log, 2, 1, vec![entry(1), entry(1)]);
        assert!(result.success);
        assert_eq!(result.last_new_index, 4);
        assert_eq!(log.next_slot(), 5);
    }

    #[test]
    fn follower_rejects_on_term_mismatch_and_reports_conflict_hint() {
        let log = MemoryLogStore::new();
        log.append(entry(1));
        log.append(entry(2));
        let result = follower_apply_append_entries(&log, 2, 99, vec![]);
        assert!(!result.success);
        assert!(result.conflict_hint.is_some());
    }

    #[test]
    fn follower_truncates_conflicting_suffix() {
        let log = MemoryLogStore::new();
        log.append(entry(1));
        log.append(entry(1)); // idx 2, will conflict
        log.append(entry(1)); // idx 3, will be truncated away
        let result = follower_apply_append_entries(&log, 1, 1, vec![entry(2)]);
        assert!(result.success);
        assert_eq!(log.next_slot(), 3);
        assert_eq!(log.term_at(2), 2);
    }

    #[test]
    fn commit_index_never_exceeds_leader_commit_or_last_new_index() {
        assert_eq!(follower_commit_index(0, 10, 5), 5);
        assert_eq!(follower_commit_index(0, 3, 5), 3);
        assert_eq!(follower_commit_index(7, 3, 5), 7);
    }

    #[test]
    fn plan_requests_snapshot_when_prev_below_log_start() {
        let log = MemoryLogStore::new();
        for _ in 0..10 {
            log.append(entry(1));
        }
        log.compact(5);
        let plan = plan_append_entries(&log, 3, 64, None);
        assert!(plan.needs_snapshot);
    }

    #[test]
    fn plan_respects_max_append_size() {
        let log = MemoryLogStore::new();
        for _ in 0..20 {
            log.append(entry(1));
        }
        let plan = plan_append_entries(&log, 1, 5, None);
        assert_eq!(plan.entries.len(), 5);
    }
}

//! Custom-notification module (C9, spec §4.7).
//!
//! The wire encoding lives in [`crate::message::notification`]; this
//! module is the orchestrator-side reaction logic, kept pure so the
//! decision rules are directly testable.

use crate::message::notification::CustomNotification;
use crate::types::LogIndex;

/// What the orchestrator should do in response to an inbound
/// notification. The orchestrator performs the actual side effects
/// (resetting timers, firing callbacks, forcing an election).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    /// Follower: mark `out_of_log_range`, reset the election timer
    /// (without changing term), and fire the `OutOfLogRangeWarning`
    /// callback with the leader's reported start index.
    EnterOutOfLogRange { start_idx_of_leader: LogIndex },
    /// Triggers a forced real-vote round bypassing priority gating.
    ForceElection,
    /// The leader should begin a leadership-transfer handoff to the
    /// requesting follower.
    BeginResignationTransfer,
    /// Nothing to do (e.g. a response carrying no notification).
    None,
}

/// Decides the reaction to an inbound request-side notification.
pub fn decide_request_action(notification: &CustomNotification) -> NotificationAction {
    match notification {
        CustomNotification::OutOfLogRangeWarning { start_idx_of_leader } => {
            NotificationAction::EnterOutOfLogRange {
                start_idx_of_leader: *start_idx_of_leader,
            }
        }
        CustomNotification::LeadershipTakeover => NotificationAction::ForceElection,
        CustomNotification::RequestResignation => NotificationAction::BeginResignationTransfer,
    }
}

/// Leader-side: decides whether a follower's reported `last_log_idx`
/// warrants an out-of-log-range warning (spec §4.7): the follower's log
/// no longer overlaps the leader's retained log at all.
pub fn needs_out_of_log_range_warning(follower_last_log_idx: LogIndex, leader_log_start_index: LogIndex) -> bool {
    follower_last_log_idx + 1 < leader_log_start_index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_log_range_warning_maps_to_enter_action() {
        let action = decide_request_action(&CustomNotification::OutOfLogRangeWarning {
            start_idx_of_leader: 1000,
        });
        assert_eq!(
            action,
            NotificationAction::EnterOutOfLogRange { start_idx_of_leader: 1000 }
        );
    }

    #[test]
    fn leadership_takeover_forces_an_election() {
        assert_eq!(
            decide_request_action(&CustomNotification::LeadershipTakeover),
            NotificationAction::ForceElection
        );
    }

    #[test]
    fn resignation_request_begins_transfer() {
        assert_eq!(
            decide_request_action(&CustomNotification::RequestResignation),
            NotificationAction::BeginResignationTransfer
        );
    }

    #[test]
    fn warning_needed_when_follower_has_fallen_off_the_retained_log() {
        assert!(needs_out_of_log_range_warning(499, 1000));
        assert!(!needs_out_of_log_range_warning(999, 1000));
    }
}

//! Snapshot transfer (C7, spec §4.5).
//!
//! Logical, object-addressed snapshot transfer. `obj_id = 0` always
//! carries metadata; the state machine may renumber subsequent objects
//! as it sees fit by mutating `obj_id` in `save_logical_snp_obj`.

use crate::error::Result;
use crate::snapshot::{SnapshotDescriptor, SnapshotSyncReq};
use crate::traits::{SnpCtx, StateMachine};

/// Guarantees `free_user_snp_ctx` runs on every exit path of a transfer
/// (spec §8, P8), including early returns from a `?`.
pub struct SnapshotCtxGuard<'a> {
    state_machine: &'a dyn StateMachine,
    ctx: Option<SnpCtx>,
}

impl<'a> SnapshotCtxGuard<'a> {
    pub fn new(state_machine: &'a dyn StateMachine) -> Self {
        SnapshotCtxGuard { state_machine, ctx: None }
    }

    pub fn ctx_mut(&mut self) -> &mut Option<SnpCtx> {
        &mut self.ctx
    }
}

impl<'a> Drop for SnapshotCtxGuard<'a> {
    fn drop(&mut self) {
        self.state_machine.free_user_snp_ctx(&mut self.ctx);
    }
}

/// Leader side: reads the next object for a snapshot transfer to one
/// peer and packages it as an `install_snapshot` request body.
pub fn leader_next_snapshot_chunk(
    state_machine: &dyn StateMachine,
    ctx_guard: &mut SnapshotCtxGuard,
    descriptor: SnapshotDescriptor,
    obj_id: u64,
) -> Result<SnapshotSyncReq> {
    let (data, is_last) =
        state_machine.read_logical_snp_obj(&descriptor, ctx_guard.ctx_mut(), obj_id)?;
    Ok(SnapshotSyncReq {
        descriptor,
        offset: obj_id,
        data,
        done: is_last,
    })
}

/// Follower side: persists one received object. Returns `true` once the
/// transfer is complete and the snapshot has been applied (spec §4.5
/// step 4: `commit_idx := descriptor.last_log_idx`, install config,
/// truncate log, reset log start — the caller does the log-level parts;
/// this only drives the state-machine contract and reports completion).
pub fn follower_apply_snapshot_chunk(
    state_machine: &dyn StateMachine,
    obj_id: &mut u64,
    is_first: bool,
    sync: &SnapshotSyncReq,
) -> Result<bool> {
    let was_metadata = *obj_id == 0;
    state_machine.save_logical_snp_obj(&sync.descriptor, obj_id, &sync.data, is_first, sync.done)?;
    if sync.done && !was_metadata {
        return state_machine.apply_snapshot(&sync.descriptor);
    }
    Ok(false)
}

/// Decides whether `commit_idx - log.start_index() >= snapshot_distance`
/// triggers a new snapshot creation (spec §4.5). `snapshot_distance == 0`
/// disables automatic creation.
pub fn should_create_snapshot(commit_idx: u64, log_start_index: u64, snapshot_distance: u64) -> bool {
    snapshot_distance != 0 && commit_idx.saturating_sub(log_start_index) >= snapshot_distance
}

/// Backoff schedule for a peer's snapshot/replication retries: doubles
/// each failure, capped at `rpc_failure_backoff_ms` (spec §4.5).
pub fn next_backoff_ms(current_backoff_ms: u64, cap_ms: u64) -> u64 {
    if current_backoff_ms == 0 {
        cap_ms.min(10)
    } else {
        (current_backoff_ms * 2).min(cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::CalculatorStateMachine;
    use crate::srv_config::ClusterConfig;

    fn descriptor() -> SnapshotDescriptor {
        SnapshotDescriptor {
            last_log_idx: 999,
            last_log_term: 3,
            last_config: ClusterConfig::new(1, 0),
            size_bytes: 0,
        }
    }

    #[test]
    fn metadata_object_is_always_zero() {
        let sm = CalculatorStateMachine::new();
        let mut guard = SnapshotCtxGuard::new(&sm);
        let chunk = leader_next_snapshot_chunk(&sm, &mut guard, descriptor(), 0).unwrap();
        assert!(!chunk.done);
        assert_eq!(chunk.offset, 0);
    }

    #[test]
    fn follower_applies_snapshot_once_transfer_completes() {
        let sm = CalculatorStateMachine::new();
        let mut obj_id = 0u64;
        let meta = SnapshotSyncReq {
            descriptor: descriptor(),
            offset: 0,
            data: vec![],
            done: false,
        };
        assert!(!follower_apply_snapshot_chunk(&sm, &mut obj_id, true, &meta).unwrap());
        assert_eq!(obj_id, 1);

        let mut w = crate::message::codec::Writer::new();
        w.put_i64(42);
        let data_chunk = SnapshotSyncReq {
            descriptor: descriptor(),
            offset: 1,
            data: w.into_bytes(),
            done: true,
        };
        assert!(follower_apply_snapshot_chunk(&sm, &mut obj_id, false, &data_chunk).unwrap());
        assert_eq!(sm.value(), 42);
    }

    #[test]
    fn snapshot_creation_respects_distance_and_disables_at_zero() {
        assert!(!should_create_snapshot(100, 0, 0));
        assert!(!should_create_snapshot(100, 50, 100));
        assert!(should_create_snapshot(150, 50, 100));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(next_backoff_ms(0, 500), 10);
        assert_eq!(next_backoff_ms(10, 500), 20);
        assert_eq!(next_backoff_ms(400, 500), 500);
        assert_eq!(next_backoff_ms(500, 500), 500);
    }
}

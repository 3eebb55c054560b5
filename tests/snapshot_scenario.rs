//! End-to-end scenario 4 from spec.md §8: an out-of-log-range warning
//! callback followed by a two-round logical snapshot transfer, driven
//! directly through `RaftServer::handle_request` the way a peer's wire
//! traffic would arrive.

mod common;

use std::sync::{Arc, Mutex};

use raft_engine::fixtures::{CalculatorStateMachine, ChannelNetwork, ChannelTransportFactory, MemoryLogStore, MemoryStateManager};
use raft_engine::message::codec::Writer;
use raft_engine::message::notification::CustomNotification;
use raft_engine::message::{ReqMsg, ReqPayload, RespPayload};
use raft_engine::server::CallbackEvent;
use raft_engine::snapshot::{SnapshotDescriptor, SnapshotSyncReq};
use raft_engine::traits::StateMachine;
use raft_engine::RaftServer;

use common::{cluster_config, fast_config};

#[test]
fn out_of_log_range_warning_then_snapshot_install_catches_up() {
    let id = 1;
    let log = Arc::new(MemoryLogStore::new());
    let state_machine = Arc::new(CalculatorStateMachine::new());
    let state_manager = Arc::new(MemoryStateManager::new(id, cluster_config(&[id])));
    let network = ChannelNetwork::new();
    let factory = Arc::new(ChannelTransportFactory::new(network));

    let server = RaftServer::start(id, fast_config(), log.clone(), state_machine.clone(), state_manager, factory).unwrap();

    let warnings: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let warnings_cb = warnings.clone();
    server.set_callback(move |event| {
        if let CallbackEvent::OutOfLogRangeWarning { start_idx_of_leader } = event {
            warnings_cb.lock().unwrap().push(start_idx_of_leader);
        }
    });

    let warning_req = ReqMsg {
        term: 1,
        src: 99,
        dst: id,
        last_log_idx: 0,
        last_log_term: 0,
        commit_idx: 0,
        payload: ReqPayload::CustomNotification {
            notification: CustomNotification::OutOfLogRangeWarning { start_idx_of_leader: 1000 },
        },
    };
    server.handle_request(warning_req);
    assert_eq!(*warnings.lock().unwrap(), vec![1000]);

    let descriptor = SnapshotDescriptor {
        last_log_idx: 999,
        last_log_term: 3,
        last_config: cluster_config(&[id]),
        size_bytes: 0,
    };

    let metadata_req = ReqMsg {
        term: 1,
        src: 99,
        dst: id,
        last_log_idx: descriptor.last_log_idx,
        last_log_term: descriptor.last_log_term,
        commit_idx: 0,
        payload: ReqPayload::InstallSnapshot {
            sync: SnapshotSyncReq {
                descriptor: descriptor.clone(),
                offset: 0,
                data: vec![],
                done: false,
            },
        },
    };
    let metadata_resp = server.handle_request(metadata_req);
    assert!(metadata_resp.accepted);
    match metadata_resp.payload {
        RespPayload::InstallSnapshot { next_obj_id } => assert_eq!(next_obj_id, Some(1)),
        other => panic!("unexpected payload {other:?}"),
    }

    let mut value_chunk = Writer::new();
    value_chunk.put_i64(42);
    let data_req = ReqMsg {
        term: 1,
        src: 99,
        dst: id,
        last_log_idx: descriptor.last_log_idx,
        last_log_term: descriptor.last_log_term,
        commit_idx: 0,
        payload: ReqPayload::InstallSnapshot {
            sync: SnapshotSyncReq {
                descriptor: descriptor.clone(),
                offset: 1,
                data: value_chunk.into_bytes(),
                done: true,
            },
        },
    };
    let data_resp = server.handle_request(data_req);
    assert!(data_resp.accepted);
    assert_eq!(data_resp.next_idx, Some(1000));
    match data_resp.payload {
        RespPayload::InstallSnapshot { next_obj_id } => assert_eq!(next_obj_id, None),
        other => panic!("unexpected payload {other:?}"),
    }

    assert_eq!(state_machine.value(), 42);
    assert_eq!(state_machine.last_commit_index(), 999);
    assert_eq!(log.start_index(), 1000);

    server.shutdown();
}

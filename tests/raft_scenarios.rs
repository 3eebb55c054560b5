//! End-to-end scenarios 1-3 from spec.md §8: a 3-node happy path, a
//! leader kill and re-election with a later rejoin, and a wire
//! round-trip for the cluster membership descriptor.

mod common;

use std::time::{Duration, Instant};

use raft_engine::fixtures::{encode_calc_op, CalcOp};
use raft_engine::message::codec::WireCodec;
use raft_engine::srv_config::ClusterServer;
use raft_engine::traits::StateMachine;

use common::{decode_i64, Cluster};

#[test]
fn three_node_happy_path_commits_in_order() {
    let cluster = Cluster::start(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(Duration::from_secs(2));

    let first = leader
        .server
        .append_entries(encode_calc_op(CalcOp::Add, 3))
        .expect("first write commits");
    assert_eq!(decode_i64(&first), 3);

    let second = leader
        .server
        .append_entries(encode_calc_op(CalcOp::Add, 5))
        .expect("second write commits");
    assert_eq!(decode_i64(&second), 8);

    // Followers replicate and apply asynchronously; wait for convergence.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if cluster.nodes.iter().all(|n| n.state_machine.value() == 8) {
            break;
        }
        assert!(Instant::now() < deadline, "followers never converged on the leader's value");
        std::thread::sleep(Duration::from_millis(10));
    }

    let commit_indices: Vec<_> = cluster.nodes.iter().map(|n| n.state_machine.last_commit_index()).collect();
    assert!(
        commit_indices.iter().all(|&idx| idx == commit_indices[0]),
        "commit indices diverged across the cluster: {commit_indices:?}"
    );
}

#[test]
fn leader_kill_reelects_and_catches_up_on_restart() {
    let mut cluster = Cluster::start(&[1, 2, 3]);
    let old_leader_id = cluster.wait_for_leader(Duration::from_secs(2)).id;

    cluster
        .node(old_leader_id)
        .server
        .append_entries(encode_calc_op(CalcOp::Add, 3))
        .unwrap();
    cluster
        .node(old_leader_id)
        .server
        .append_entries(encode_calc_op(CalcOp::Add, 5))
        .unwrap();

    cluster.node(old_leader_id).kill();

    let new_leader_id = {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(n) = cluster.nodes.iter().find(|n| n.id != old_leader_id && n.server.is_leader()) {
                break n.id;
            }
            assert!(Instant::now() < deadline, "no new leader elected after the old leader died");
            std::thread::sleep(Duration::from_millis(10));
        }
    };

    let result = cluster
        .node(new_leader_id)
        .server
        .append_entries(encode_calc_op(CalcOp::Mul, 2))
        .expect("the new leader accepts writes");
    assert_eq!(decode_i64(&result), 16);

    cluster.restart(old_leader_id);
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if cluster.node(old_leader_id).state_machine.value() == 16 {
            break;
        }
        assert!(Instant::now() < deadline, "restarted node never caught up to the new leader");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn server_descriptor_roundtrips_over_the_wire() {
    let original = ClusterServer::new(42, "host:9000");
    let decoded = ClusterServer::from_bytes(&original.to_bytes()).unwrap();
    assert_eq!(original, decoded);
}

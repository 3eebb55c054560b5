//! End-to-end scenario 5 from spec.md §8: a follower auto-forwards a
//! client write to the leader rather than rejecting it, and concurrent
//! forwarded writes still both land exactly once.

mod common;

use std::thread;
use std::time::Duration;

use raft_engine::fixtures::{encode_calc_op, CalcOp};

use common::{decode_i64, fast_config, Cluster};

#[test]
fn follower_forwards_concurrent_writes_to_the_leader() {
    let mut config = fast_config();
    config.auto_forwarding = true;
    config.auto_forwarding_max_connections = 1;

    let cluster = Cluster::start_with_config(&[1, 2, 3], config);
    let leader_id = cluster.wait_for_leader(Duration::from_secs(2)).id;
    let followers: Vec<_> = cluster.nodes.iter().map(|n| n.id).filter(|&id| id != leader_id).collect();
    assert_eq!(followers.len(), 2);

    let first_follower = cluster.node(followers[0]).server.clone();
    let second_follower = cluster.node(followers[1]).server.clone();

    let t1 = thread::spawn(move || first_follower.append_entries(encode_calc_op(CalcOp::Add, 1)));
    let t2 = thread::spawn(move || second_follower.append_entries(encode_calc_op(CalcOp::Add, 1)));

    let r1 = t1.join().unwrap().expect("first forwarded write succeeds");
    let r2 = t2.join().unwrap().expect("second forwarded write succeeds");

    let values: Vec<i64> = [r1, r2].iter().map(|b| decode_i64(b)).collect();
    assert!(values.contains(&1) && values.contains(&2), "unexpected forwarded results: {values:?}");

    assert_eq!(cluster.node(leader_id).state_machine.value(), 2);
}

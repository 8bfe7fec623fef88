//! Crash and restart tests: durable term, vote and log.


use std::sync::Arc;
use std::time::Duration;

use test_harness::{test_node_config, TestCluster};
use tokio::sync::mpsc;

use raft_lite::error::RaftError;
use raft_lite::raft::{MemoryPersister, Persister, RaftNode};
use raft_lite::testing::MemoryNetwork;

/// Test 1: Whole cluster restarts and keeps every committed entry
#[tokio::test]
async fn test_full_cluster_restart() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.one(b"a", 3, Duration::from_secs(5)).await;
    cluster.one(b"b", 3, Duration::from_secs(5)).await;

    for id in cluster.ids() {
        cluster.crash_node(id);
    }
    for id in cluster.ids() {
        cluster.start_node(id);
    }

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected after restart");

    // Old entries are applied again once something new commits
    let index = cluster.one(b"c", 3, Duration::from_secs(5)).await;
    assert_eq!(index, 3);
    assert_eq!(cluster.n_committed(1), (3, Some(b"a".to_vec())));
    assert_eq!(cluster.n_committed(2), (3, Some(b"b".to_vec())));
    cluster.shutdown();
}

/// Test 2: Term and vote survive a restart
#[tokio::test]
async fn test_term_and_vote_survive_restart() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let term = cluster.node(leader).current_term().await;

    cluster.crash_node(leader);

    let persister = cluster.persisters[&leader].clone();
    let state = raft_lite::raft::persist::restore(&persister).unwrap();
    assert!(state.current_term >= term);
    assert_eq!(
        state.voted_for,
        Some(leader),
        "Vote for the current term should be durable"
    );

    // Restarted node never goes back to an older term
    cluster.start_node(leader);
    let restarted_term = cluster.node(leader).current_term().await;
    assert!(restarted_term >= term);
    cluster.shutdown();
}

/// Test 3: Repeated crashes of random nodes never lose committed entries
#[tokio::test]
async fn test_crash_churn_keeps_committed_entries() {
    let mut cluster = TestCluster::new(5).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let mut committed = Vec::new();
    for round in 0..4u64 {
        let cmd = format!("churn-{}", round);
        let index = cluster.one(cmd.as_bytes(), 3, Duration::from_secs(10)).await;
        committed.push((index, cmd));

        // Crash two nodes, then bring them back
        let victims = [round % 5 + 1, (round + 2) % 5 + 1];
        for &id in &victims {
            cluster.crash_node(id);
        }
        cluster.one(format!("while-down-{}", round).as_bytes(), 3, Duration::from_secs(10)).await;
        for &id in &victims {
            cluster.start_node(id);
        }
    }

    let last = cluster.one(b"end", 5, Duration::from_secs(10)).await;
    assert!(last > committed.last().unwrap().0);
    for (index, cmd) in committed {
        assert_eq!(cluster.n_committed(index), (5, Some(cmd.into_bytes())));
    }
    cluster.shutdown();
}

/// Test 4: A node whose storage fails stops instead of answering
#[tokio::test]
async fn test_persist_failure_kills_node() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.one(b"ok", 3, Duration::from_secs(5)).await;

    cluster.persisters[&leader].set_fail_writes(true);
    let result = cluster.node(leader).raft_node.start(b"lost".to_vec()).await;
    assert!(
        matches!(result, Err(RaftError::Persistence(_))),
        "start should surface the storage failure, got {:?}",
        result
    );
    assert!(cluster.node(leader).raft_node.killed());

    // Further calls fail fast
    assert!(matches!(
        cluster.node(leader).raft_node.start(b"again".to_vec()).await,
        Err(RaftError::Shutdown)
    ));

    // The rest of the cluster carries on without it
    let new_leader = cluster
        .wait_for_new_leader(leader, Duration::from_secs(5))
        .await
        .expect("Survivors should elect a leader");
    assert_ne!(new_leader, leader);
    let after = cluster.one(b"after", 2, Duration::from_secs(5)).await;

    // With storage healthy again, the node restarts from what it saved
    cluster.persisters[&leader].set_fail_writes(false);
    cluster.start_node(leader);
    assert!(cluster.wait_committed(after, 3, Duration::from_secs(5)).await);
    assert_eq!(cluster.n_committed(after).1, Some(b"after".to_vec()));
    cluster.shutdown();
}

/// Test 5: A follower persists entries before acknowledging them
#[tokio::test]
async fn test_follower_persists_before_reply() {
    let network = MemoryNetwork::new();
    let persister = MemoryPersister::new();
    let (apply_tx, _apply_rx) = mpsc::channel(16);
    let node = RaftNode::new(
        test_node_config(1, 3),
        network.transport(1),
        Arc::new(persister.clone()),
        apply_tx,
    )
    .unwrap();

    let args = raft_lite::raft::rpc::AppendEntriesArgs {
        term: 2,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![raft_lite::raft::LogEntry {
            index: 1,
            term: 2,
            command: b"x".to_vec(),
        }],
        leader_commit: 0,
    };
    let reply = node.handle_append_entries(args).await.unwrap();
    assert!(reply.success);

    // Already durable by the time the reply exists
    let state = raft_lite::raft::persist::restore(&persister).unwrap();
    assert_eq!(state.current_term, 2);
    assert_eq!(state.last_log_index(), 1);
    assert!(persister.raft_state_size() > 0);

    // A write failure turns into an error reply, never a success
    persister.set_fail_writes(true);
    let vote = raft_lite::raft::rpc::RequestVoteArgs {
        term: 3,
        candidate_id: 3,
        last_log_index: 1,
        last_log_term: 2,
    };
    assert!(matches!(
        node.handle_request_vote(vote).await,
        Err(RaftError::Persistence(_))
    ));
    assert!(node.killed(), "Node should stop after a failed write");
}

/// Test 6: RPCs from nodes outside the cluster are refused
#[tokio::test]
async fn test_unknown_sender_rejected() {
    let network = MemoryNetwork::new();
    let (apply_tx, _apply_rx) = mpsc::channel(16);
    let node = RaftNode::new(
        test_node_config(1, 3),
        network.transport(1),
        Arc::new(MemoryPersister::new()),
        apply_tx,
    )
    .unwrap();

    let vote = raft_lite::raft::rpc::RequestVoteArgs {
        term: 1,
        candidate_id: 9,
        last_log_index: 0,
        last_log_term: 0,
    };
    assert!(matches!(
        node.handle_request_vote(vote).await,
        Err(RaftError::InvalidArgument(_))
    ));
    assert_eq!(node.get_state().await, (0, false));
}

//! Network partition tests: majority and minority behavior, healing and
//! split-brain prevention.


use std::time::Duration;
use test_harness::{assert_eventually, TestCluster};

/// Test 1: Majority partition elects a leader
#[tokio::test]
async fn test_majority_partition_elects_leader() {
    let mut cluster = TestCluster::new(5).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    let majority = [1, 2, 3];
    let minority = [4, 5];
    cluster.create_partition(&majority, &minority);

    let leader = cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await
        .expect("Majority partition should elect a leader");
    assert!(majority.contains(&leader));

    // And it can still commit
    let (index, _) = cluster.node(leader).raft_node.start(b"maj".to_vec()).await.unwrap();
    assert!(cluster.wait_committed(index, 3, Duration::from_secs(5)).await);

    cluster.shutdown();
}

/// Test 2: Minority partition cannot elect a leader or commit
#[tokio::test]
async fn test_minority_partition_cannot_elect_leader() {
    let mut cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    // Put the current leader in the majority so the minority starts leaderless
    let others: Vec<u64> = cluster.ids().into_iter().filter(|&id| id != leader).collect();
    let minority = [others[0], others[1]];
    let majority = [leader, others[2], others[3]];
    cluster.create_partition(&majority, &minority);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        cluster.leader_in_group(&minority).await,
        None,
        "Minority partition must not elect a leader"
    );

    // Terms in the minority climb from repeated failed elections
    let minority_term = cluster.node(minority[0]).current_term().await;
    assert!(minority_term > cluster.node(leader).current_term().await);

    cluster.shutdown();
}

/// Test 3: Logs converge after the partition heals
#[tokio::test]
async fn test_partition_healing_logs_converge() {
    let mut cluster = TestCluster::new(5).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.one(b"before", 5, Duration::from_secs(5)).await;

    let majority = [1, 2, 3];
    let minority = [4, 5];
    cluster.create_partition(&majority, &minority);
    let leader = cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await
        .expect("Majority should elect a leader");

    for i in 0..5 {
        let cmd = format!("during-{}", i);
        cluster.node(leader).raft_node.start(cmd.into_bytes()).await.unwrap();
    }
    assert!(cluster.wait_committed(6, 3, Duration::from_secs(5)).await);
    assert_eq!(cluster.node(4).last_applied(), 1);
    assert_eq!(cluster.node(5).last_applied(), 1);

    cluster.heal_partition();
    assert!(
        cluster.wait_committed(6, 5, Duration::from_secs(10)).await,
        "Formerly partitioned nodes should catch up"
    );
    for i in 2..=6u64 {
        let (n, cmd) = cluster.n_committed(i);
        assert_eq!(n, 5);
        assert_eq!(cmd, Some(format!("during-{}", i - 2).into_bytes()));
    }
    cluster.shutdown();
}

/// Test 4: Split brain prevention - exactly one leader after partition heals
#[tokio::test]
async fn test_split_brain_prevention() {
    let mut cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    // Strand the leader in the minority
    let others: Vec<u64> = cluster.ids().into_iter().filter(|&id| id != leader).collect();
    let minority = [leader, others[0]];
    let majority = [others[1], others[2], others[3]];
    cluster.create_partition(&minority, &majority);

    cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await
        .expect("Majority should elect a new leader");

    // Two nodes claim leadership, but never in the same term
    cluster.check_one_leader_per_term().await;

    cluster.heal_partition();
    assert_eventually(
        || async { cluster.count_leaders().await == 1 },
        Duration::from_secs(5),
        "Exactly one leader should remain after healing",
    )
    .await;
    cluster.check_one_leader_per_term().await;

    cluster.shutdown();
}

/// Test 5: One-way link failures do not stop progress
#[tokio::test]
async fn test_cut_links_between_followers() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let followers: Vec<u64> = cluster.ids().into_iter().filter(|&id| id != leader).collect();

    // Followers cannot talk to each other, only to the leader
    cluster.network.cut(followers[0], followers[1]);

    for i in 0..3 {
        let cmd = format!("cut-{}", i);
        cluster.one(cmd.as_bytes(), 3, Duration::from_secs(5)).await;
    }
    assert_eq!(cluster.get_leader_id().await, Some(leader));

    cluster.network.heal(followers[0], followers[1]);
    cluster.shutdown();
}

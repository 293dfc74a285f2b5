//! Leader election over real TCP connections.

mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use raft_kv_store::Error;
use raft_kv_store::consensus::Consensus;

use common::TestCluster;

#[tokio::test]
async fn test_integration_basic_election() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17101).await?;

    cluster.node(1).raft.campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;
    cluster
        .wait_for_leader_consensus(1, Duration::from_secs(5))
        .await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_integration_election_without_campaign() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17151).await?;

    // Election timeouts alone are enough.
    let leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    cluster
        .wait_for_leader_consensus(leader, Duration::from_secs(5))
        .await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_integration_follower_timeout() -> Result<()> {
    let mut cluster = TestCluster::spawn(3, 17201).await?;
    cluster.elect_first().await?;

    // Simulates leader failure.
    cluster.stop(1).await;

    let new_leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    assert!(new_leader == 2 || new_leader == 3, "new leader should be node 2 or 3");

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_integration_forced_campaign_follower() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17301).await?;
    cluster.elect_first().await?;

    cluster.node(2).raft.campaign().await?;

    let leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    assert!(leader == 1 || leader == 2, "leader should be node 1 or 2");

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_integration_no_split_brain() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17501).await?;
    cluster.elect_first().await?;

    cluster.node(2).raft.campaign().await?;

    // Poll repeatedly during the election.
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        let leaders: Vec<(u64, u64)> = cluster
            .running()
            .map(|node| node.raft.status())
            .filter(|status| status.is_leader())
            .map(|status| (status.node_id, status.term))
            .collect();
        let mut terms: Vec<u64> = leaders.iter().map(|(_, term)| *term).collect();
        terms.sort_unstable();
        terms.dedup();
        // Two nodes may both believe they lead for a moment, but never in
        // the same term.
        assert_eq!(terms.len(), leaders.len(), "SPLIT BRAIN DETECTED: {leaders:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_integration_leader_step_down() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17601).await?;
    cluster.elect_first().await?;
    let initial_term = cluster.node(1).raft.term();

    cluster.node(2).raft.campaign().await?;

    let start = Instant::now();
    while cluster.node(1).raft.term() <= initial_term {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "node 1 never saw the higher term"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    cluster
        .wait_for_leader_consensus(leader, Duration::from_secs(5))
        .await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_integration_leader_losing_quorum_fails_pending_proposals() -> Result<()> {
    let mut cluster =
        TestCluster::spawn_with(3, 17701, |config| config.raft.check_quorum = true).await?;
    cluster.elect_first().await?;

    // Leaves node 1 leading a minority of one.
    cluster.stop(2).await;
    cluster.stop(3).await;

    let err = cluster
        .node(1)
        .gateway
        .set("/stranded", "v", None)
        .await
        .unwrap_err();
    assert_eq!(err, Error::ProposalLost);
    assert!(!cluster.node(1).raft.is_leader());
    assert!(cluster.node(1).gateway.get("/stranded", false, false).is_err());

    let err = cluster
        .node(1)
        .gateway
        .set("/stranded", "v", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotLeader { .. }), "got {err:?}");

    cluster.shutdown().await;
    Ok(())
}

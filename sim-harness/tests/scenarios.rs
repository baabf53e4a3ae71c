//! End-to-end cluster scenarios, driven entirely through `SimCluster` over a deterministic
//! `netsim::Simulator`: election, replication, failure recovery, snapshot catch-up, log-matching
//! conflict resolution and membership change.
//!
//! RUST_LOG=raft_core,memstore,sim_harness,scenarios=trace cargo test -p sim-harness --test scenarios

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use memstore::ClientRequest;
use netsim::NetworkLink;
use raft_core::raft::Entry;
use raft_core::raft::EntryNormal;
use raft_core::raft::EntryPayload;
use raft_core::Config;
use raft_core::LogId;
use raft_core::RaftStorageDebug;
use raft_core::SnapshotPolicy;
use raft_core::State;
use sim_harness::SimCluster;

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Election and heartbeat timeouts short enough for scenario tests to settle quickly, but still
/// respecting `heartbeat_interval < election_timeout_min`.
fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("scenarios".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(30)
            .validate()
            .expect("failed to build Raft config"),
    )
}

/// A low-latency, perfectly reliable link, so a settled cluster's steady state is reached well
/// within an election timeout.
fn fast_link() -> NetworkLink {
    NetworkLink::reliable(Duration::from_millis(2))
}

fn write(client: &str, serial: u64, status: &str) -> ClientRequest {
    ClientRequest {
        client: client.into(),
        serial,
        status: status.into(),
    }
}

const SETTLE: Duration = Duration::from_secs(5);

/// S1: a single-node cluster elects itself leader with no peers to contact.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_self_election() -> Result<()> {
    init_tracing();

    let cluster = SimCluster::new(1, test_config(), fast_link());
    cluster.add_node(0).await?;
    cluster.initialize(0, btreeset! {0}).await?;

    let metrics = cluster.wait_for_state(0, State::Leader, SETTLE, "n0 becomes leader of a single-node cluster").await?;
    assert_eq!(metrics.current_leader, Some(0));
    assert_eq!(metrics.current_term, 1);

    cluster.shutdown().await?;
    Ok(())
}

/// S2: in a 3-node cluster, isolating the current leader forces the remaining majority to elect a
/// new one; the isolated node cannot, since it can no longer reach a quorum.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn partitioned_three_node_election() -> Result<()> {
    init_tracing();

    let cluster = SimCluster::new(2, test_config(), fast_link());
    for id in 0..3 {
        cluster.add_node(id).await?;
    }
    cluster.initialize(0, btreeset! {0, 1, 2}).await?;
    cluster.wait_for_state(0, State::Leader, SETTLE, "n0 becomes initial leader").await?;

    let leader = cluster.current_leader().await.expect("cluster has a leader");
    cluster.isolate(leader).await?;

    let remaining: Vec<u64> = (0..3).filter(|id| *id != leader).collect();
    let mut new_leader = None;
    for id in &remaining {
        if cluster.wait_for_state(*id, State::Leader, SETTLE, "majority elects a new leader").await.is_ok() {
            new_leader = Some(*id);
            break;
        }
    }
    let new_leader = new_leader.expect("majority partition elects a new leader");
    assert_ne!(new_leader, leader, "the isolated node cannot be re-elected while cut off");

    cluster.shutdown().await?;
    Ok(())
}

/// S3: with full connectivity, client writes submitted to the leader replicate to every node's
/// state machine.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn full_connectivity_replication() -> Result<()> {
    init_tracing();

    let cluster = SimCluster::new(3, test_config(), fast_link());
    for id in 0..3 {
        cluster.add_node(id).await?;
    }
    cluster.initialize(0, btreeset! {0, 1, 2}).await?;
    cluster.wait_for_state(0, State::Leader, SETTLE, "n0 becomes leader").await?;

    let mut last_index = 0;
    for i in 0..10 {
        let resp = cluster.client_write(0, write("alice", i, &format!("status-{}", i))).await.expect("client write succeeds");
        assert_eq!(resp.0, None, "first write for a fresh serial has no prior status");
    }

    for id in 0..3 {
        let metrics = cluster.wait_for_log(id, 11, SETTLE, "every node applies all 10 writes plus the initial leader log").await?;
        last_index = last_index.max(metrics.last_applied);
    }
    assert!(last_index >= 11);

    for id in 0..3 {
        let sto = cluster.storage(id).await?;
        let sm = sto.get_state_machine().await;
        assert_eq!(sm.client_status.get("alice"), Some(&"status-9".to_string()), "node {} converges on the final status", id);
    }

    cluster.shutdown().await?;
    Ok(())
}

/// S4: after the leader fails (is partitioned away), the remaining majority elects a new leader
/// and continues committing writes; once the old leader rejoins, it catches up to the new log.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_failure_and_commit_recovery() -> Result<()> {
    init_tracing();

    let cluster = SimCluster::new(4, test_config(), fast_link());
    for id in 0..3 {
        cluster.add_node(id).await?;
    }
    cluster.initialize(0, btreeset! {0, 1, 2}).await?;
    cluster.wait_for_state(0, State::Leader, SETTLE, "n0 becomes leader").await?;

    cluster.client_write(0, write("bob", 0, "before-failure")).await.expect("write before failure succeeds");

    let old_leader = cluster.current_leader().await.expect("cluster has a leader");
    cluster.isolate(old_leader).await?;

    let remaining: Vec<u64> = (0..3).filter(|id| *id != old_leader).collect();
    let mut new_leader = None;
    for id in &remaining {
        if cluster.wait_for_state(*id, State::Leader, SETTLE, "majority elects a replacement leader").await.is_ok() {
            new_leader = Some(*id);
            break;
        }
    }
    let new_leader = new_leader.expect("a new leader is elected after the old one fails");

    let resp = cluster.client_write(new_leader, write("bob", 1, "after-failure")).await.expect("write under new leader succeeds");
    assert_eq!(resp.0, Some("before-failure".to_string()));

    for id in &remaining {
        cluster.wait_for_log(*id, 4, SETTLE, "majority nodes apply the post-failure write").await?;
    }

    cluster.restore(old_leader).await?;
    cluster.wait_for_log(old_leader, 4, SETTLE, "rejoined node catches up to the new leader's log").await?;

    let sto = cluster.storage(old_leader).await?;
    let sm = sto.get_state_machine().await;
    assert_eq!(sm.client_status.get("bob"), Some(&"after-failure".to_string()));

    cluster.shutdown().await?;
    Ok(())
}

/// S5: a node added long after log compaction has purged the early entries it would need is
/// caught up via `InstallSnapshot` rather than a futile `AppendEntries` replay.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_install_catches_up_lagging_follower() -> Result<()> {
    init_tracing();

    let config = Arc::new(
        Config::build("scenarios".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(30)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(10))
            .validate()
            .expect("failed to build Raft config"),
    );
    let cluster = SimCluster::new(5, config, fast_link());
    cluster.add_node(0).await?;
    cluster.initialize(0, btreeset! {0}).await?;
    cluster.wait_for_state(0, State::Leader, SETTLE, "n0 becomes leader").await?;

    for i in 0..30 {
        cluster.client_write(0, write("carol", i, &format!("status-{}", i))).await.expect("write succeeds");
    }

    let leader_metrics = cluster.wait(0, SETTLE).await?.metrics(|m| m.snapshot.is_some(), "leader takes a snapshot past the threshold").await?;
    let leader_snapshot = leader_metrics.snapshot.expect("snapshot present");

    cluster.add_node(1).await?;
    cluster.add_non_voter(0, 1).await?;

    let follower_metrics = cluster
        .wait(1, SETTLE)
        .await?
        .metrics(|m| m.snapshot.map(|s| s >= leader_snapshot).unwrap_or(false), "lagging non-voter catches up via InstallSnapshot")
        .await?;
    assert!(follower_metrics.snapshot.is_some());
    cluster.wait_for_log(1, leader_metrics.last_applied, SETTLE, "non-voter applies up to the leader's last index").await?;

    let sto = cluster.storage(1).await?;
    let sm = sto.get_state_machine().await;
    assert_eq!(sm.client_status.get("carol"), Some(&"status-29".to_string()));

    cluster.shutdown().await?;
    Ok(())
}

/// S6: a follower holding a stray, never-committed entry from an earlier term has it overwritten
/// once the real leader's entries arrive at the same index (§5.3 log matching).
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn log_matching_resolves_conflicting_entry() -> Result<()> {
    init_tracing();

    let cluster = SimCluster::new(6, test_config(), fast_link());
    for id in 0..3 {
        cluster.add_node(id).await?;
    }
    cluster.initialize(0, btreeset! {0, 1, 2}).await?;
    cluster.wait_for_state(0, State::Leader, SETTLE, "n0 becomes leader").await?;

    let leader_metrics = cluster.metrics(0).await?;
    let stray_index = leader_metrics.last_log_index + 1;
    let follower = (0..3).find(|id| *id != 0).expect("a follower exists");

    {
        let sto = cluster.storage(follower).await?;
        let mut logs = sto.get_log().await;
        logs.insert(
            stray_index,
            Entry {
                log_id: LogId::new(0, stray_index),
                payload: EntryPayload::Normal(EntryNormal { data: write("stray", 0, "never-committed") }),
            },
        );
    }

    let resp = cluster.client_write(0, write("dave", 0, "real-entry")).await.expect("leader write succeeds");
    assert_eq!(resp.0, None);

    cluster.wait_for_log(follower, stray_index, SETTLE, "follower's stray entry is overwritten by the leader's real one").await?;

    let sto = cluster.storage(follower).await?;
    let logs = sto.get_log().await;
    let resolved = logs.get(&stray_index).expect("entry at the stray index now exists");
    match &resolved.payload {
        EntryPayload::Normal(n) => assert_eq!(n.data.client, "dave", "leader's entry replaced the stray one"),
        other => panic!("expected a normal entry, got {:?}", other),
    }

    cluster.shutdown().await?;
    Ok(())
}

/// S7: a non-voter is promoted into the cluster's voting membership through joint consensus, and
/// every node converges back to a uniform configuration.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn membership_change_via_joint_consensus() -> Result<()> {
    init_tracing();

    let cluster = SimCluster::new(7, test_config(), fast_link());
    cluster.add_node(0).await?;
    cluster.initialize(0, btreeset! {0}).await?;
    cluster.wait_for_state(0, State::Leader, SETTLE, "n0 becomes leader").await?;

    cluster.add_node(1).await?;
    cluster.add_node(2).await?;
    cluster.add_non_voter(0, 1).await?;
    cluster.add_non_voter(0, 2).await?;

    let new_members: BTreeSet<u64> = btreeset! {0, 1, 2};
    cluster.change_membership(0, new_members.clone()).await?;

    for id in 0..3 {
        let metrics = cluster
            .wait(id, SETTLE)
            .await?
            .metrics(
                |m| m.membership_config.members == new_members && m.membership_config.members_after_consensus.is_none(),
                "node converges to uniform consensus over the new membership",
            )
            .await?;
        let mut members: Vec<u64> = metrics.membership_config.members.iter().cloned().collect();
        members.sort_unstable();
        assert_eq!(members, vec![0, 1, 2]);
    }

    cluster.shutdown().await?;
    Ok(())
}

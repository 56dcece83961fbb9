//! Multi-node cluster tests over an in-memory transport.
//!
//! Each test wires real engines together with channel-backed peers that can
//! be partitioned per node, then drives the cluster through the public
//! surface only: `RaftHandle` and the apply stream.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tlr_consensus::{
    AppendEntriesRequest, AppendEntriesResponse, FilePersister, MemoryPersister, Peer, Persister,
    RaftConfig, RaftEngine, RaftHandle, RaftState, RpcFuture, VoteRequest, VoteResponse,
};
use tlr_core::{LogEntry, NodeId, Result, TillerError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const POLL: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(10);

fn test_config() -> RaftConfig {
    RaftConfig {
        heartbeat_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(30),
        ..RaftConfig::default()
    }
}

/// In-memory link to another node's engine. A call fails like a dead network
/// when either endpoint is marked down, which models a symmetric partition.
struct ChannelPeer {
    target: Arc<OnceLock<RaftHandle>>,
    local_up: Arc<AtomicBool>,
    remote_up: Arc<AtomicBool>,
}

impl ChannelPeer {
    fn resolve(&self) -> Result<RaftHandle> {
        if !self.local_up.load(Ordering::SeqCst) || !self.remote_up.load(Ordering::SeqCst) {
            return Err(TillerError::Transport("link partitioned".into()));
        }
        self.target
            .get()
            .cloned()
            .ok_or_else(|| TillerError::Transport("peer not started".into()))
    }
}

impl Peer for ChannelPeer {
    fn request_vote(&self, req: VoteRequest) -> RpcFuture<VoteResponse> {
        let resolved = self.resolve();
        Box::pin(async move { resolved?.request_vote(req).await })
    }

    fn append_entries(&self, req: AppendEntriesRequest) -> RpcFuture<AppendEntriesResponse> {
        let resolved = self.resolve();
        Box::pin(async move { resolved?.append_entries(req).await })
    }
}

struct TestNode {
    id: NodeId,
    handle: RaftHandle,
    up: Arc<AtomicBool>,
    applied: Arc<Mutex<Vec<LogEntry>>>,
    shutdown: broadcast::Sender<()>,
    runner: JoinHandle<Result<()>>,
}

impl TestNode {
    fn partition(&self) {
        self.up.store(false, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.up.store(true, Ordering::SeqCst);
    }

    fn applied_entries(&self) -> Vec<LogEntry> {
        self.applied.lock().unwrap().clone()
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.runner.await.unwrap()
    }
}

fn spawn_node<S>(
    id: NodeId,
    peers: HashMap<NodeId, ChannelPeer>,
    persister: S,
    slot: &Arc<OnceLock<RaftHandle>>,
    up: Arc<AtomicBool>,
) -> TestNode
where
    S: Persister + 'static,
{
    let (engine, handle, mut apply_rx) =
        RaftEngine::new(id, peers, persister, test_config()).unwrap();
    slot.set(handle.clone()).ok().unwrap();

    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&applied);
    tokio::spawn(async move {
        while let Some(entry) = apply_rx.recv().await {
            sink.lock().unwrap().push(entry);
        }
    });

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let runner = tokio::spawn(engine.run(shutdown_rx));

    TestNode {
        id,
        handle,
        up,
        applied,
        shutdown,
        runner,
    }
}

fn build_cluster(n: usize) -> Vec<TestNode> {
    let ids: Vec<NodeId> = (1..=n as NodeId).collect();
    let slots: HashMap<NodeId, Arc<OnceLock<RaftHandle>>> = ids
        .iter()
        .map(|&id| (id, Arc::new(OnceLock::new())))
        .collect();
    let ups: HashMap<NodeId, Arc<AtomicBool>> = ids
        .iter()
        .map(|&id| (id, Arc::new(AtomicBool::new(true))))
        .collect();

    ids.iter()
        .map(|&id| {
            let peers: HashMap<NodeId, ChannelPeer> = ids
                .iter()
                .filter(|&&other| other != id)
                .map(|&other| {
                    (
                        other,
                        ChannelPeer {
                            target: Arc::clone(&slots[&other]),
                            local_up: Arc::clone(&ups[&id]),
                            remote_up: Arc::clone(&ups[&other]),
                        },
                    )
                })
                .collect();
            spawn_node(
                id,
                peers,
                MemoryPersister::new(),
                &slots[&id],
                Arc::clone(&ups[&id]),
            )
        })
        .collect()
}

async fn shutdown_cluster(nodes: Vec<TestNode>) {
    for node in nodes {
        node.stop().await.unwrap();
    }
}

/// Poll `probe` until it yields `Some`, failing the test on deadline.
async fn wait_for<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Wait until exactly one connected node reports Leader and return its id.
async fn wait_for_leader(nodes: &[TestNode]) -> NodeId {
    wait_for("a unique leader", || async move {
        let mut leaders = Vec::new();
        for node in nodes {
            if !node.up.load(Ordering::SeqCst) {
                continue;
            }
            let status = node.handle.status().await.ok()?;
            if status.state == RaftState::Leader {
                leaders.push(node.id);
            }
        }
        match leaders.as_slice() {
            [leader] => Some(*leader),
            _ => None,
        }
    })
    .await
}

/// Wait until every listed node's applied entries equal `expected`.
async fn wait_for_applied(what: &str, nodes: &[&TestNode], expected: &[LogEntry]) {
    wait_for(what, || async move {
        nodes
            .iter()
            .all(|n| n.applied_entries() == expected)
            .then_some(())
    })
    .await;
}

fn node(nodes: &[TestNode], id: NodeId) -> &TestNode {
    nodes.iter().find(|n| n.id == id).unwrap()
}

async fn status_of(n: &TestNode) -> tlr_consensus::RaftStatus {
    n.handle.status().await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_election() {
    let nodes = build_cluster(3);
    let leader = wait_for_leader(&nodes).await;

    // Everyone converges on the leader's term and knows where to redirect.
    let nodes_ref = &nodes;
    wait_for("followers to converge", || async move {
        let leader_status = node(nodes_ref, leader).handle.status().await.ok()?;
        for follower in nodes_ref.iter().filter(|n| n.id != leader) {
            let status = follower.handle.status().await.ok()?;
            if status.state != RaftState::Follower
                || status.term != leader_status.term
                || status.leader_id != Some(leader)
            {
                return None;
            }
        }
        Some(())
    })
    .await;

    shutdown_cluster(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replication_and_apply() {
    let nodes = build_cluster(3);
    let leader = wait_for_leader(&nodes).await;

    let entry = node(&nodes, leader)
        .handle
        .apply_command(Bytes::from_static(&[0x01]))
        .await
        .unwrap();
    assert_eq!(entry.id, 1);

    // Every node applies exactly that entry, in order.
    let all: Vec<&TestNode> = nodes.iter().collect();
    wait_for_applied(
        "the entry to apply everywhere",
        &all,
        std::slice::from_ref(&entry),
    )
    .await;

    for n in &nodes {
        let status = status_of(n).await;
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.last_applied, 1);
    }

    shutdown_cluster(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_apply_on_follower_is_redirected() {
    let nodes = build_cluster(3);
    let leader = wait_for_leader(&nodes).await;

    // Pick a follower that has already heard from the leader.
    let nodes_ref = &nodes;
    let follower = wait_for("a follower with a leader hint", || async move {
        for n in nodes_ref.iter().filter(|n| n.id != leader) {
            let status = n.handle.status().await.ok()?;
            if status.leader_id == Some(leader) {
                return Some(n.id);
            }
        }
        None
    })
    .await;

    let err = node(&nodes, follower)
        .handle
        .apply_command(Bytes::from_static(b"nope"))
        .await
        .unwrap_err();
    match err {
        TillerError::NotLeader { leader: hint } => assert_eq!(hint, Some(leader)),
        other => panic!("expected NotLeader, got {other}"),
    }

    // The rejected submit left no trace in the follower's log.
    let status = status_of(node(&nodes, follower)).await;
    assert_eq!(status.last_log_id, 0);

    shutdown_cluster(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failure_and_reelection() {
    let nodes = build_cluster(3);
    let first_leader = wait_for_leader(&nodes).await;
    let first_term = status_of(node(&nodes, first_leader)).await.term;

    let first_entry = node(&nodes, first_leader)
        .handle
        .apply_command(Bytes::from_static(b"one"))
        .await
        .unwrap();
    let all: Vec<&TestNode> = nodes.iter().collect();
    wait_for_applied(
        "initial entry to apply everywhere",
        &all,
        std::slice::from_ref(&first_entry),
    )
    .await;

    node(&nodes, first_leader).partition();

    // One of the survivors wins a later term.
    let second_leader = wait_for_leader(&nodes).await;
    assert_ne!(second_leader, first_leader);
    let second_term = status_of(node(&nodes, second_leader)).await.term;
    assert!(second_term > first_term);

    // The new leader commits in its own term; the survivor pair applies.
    let second_entry = node(&nodes, second_leader)
        .handle
        .apply_command(Bytes::from_static(b"two"))
        .await
        .unwrap();
    let expected = vec![first_entry, second_entry];
    let survivors: Vec<&TestNode> = nodes.iter().filter(|n| n.id != first_leader).collect();
    wait_for_applied("survivors to apply both entries", &survivors, &expected).await;

    // The deposed leader rejoins, steps down, and catches up.
    node(&nodes, first_leader).heal();
    wait_for_applied(
        "the old leader to catch up",
        &[node(&nodes, first_leader)],
        &expected,
    )
    .await;
    let nodes_ref = &nodes;
    wait_for("the old leader to step down", || async move {
        let status = node(nodes_ref, first_leader).handle.status().await.ok()?;
        (status.state == RaftState::Follower).then_some(())
    })
    .await;

    shutdown_cluster(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partitioned_follower_reconciles() {
    let nodes = build_cluster(3);
    let leader = wait_for_leader(&nodes).await;
    let straggler = nodes.iter().find(|n| n.id != leader).unwrap().id;

    node(&nodes, straggler).partition();

    // The entry commits on the majority while the straggler is away.
    let entry = node(&nodes, leader)
        .handle
        .apply_command(Bytes::from_static(b"missed"))
        .await
        .unwrap();
    let majority: Vec<&TestNode> = nodes.iter().filter(|n| n.id != straggler).collect();
    wait_for_applied(
        "the connected majority to apply",
        &majority,
        std::slice::from_ref(&entry),
    )
    .await;
    assert!(node(&nodes, straggler).applied_entries().is_empty());

    // On reconnect the leader backs next_index down and re-sends the suffix.
    node(&nodes, straggler).heal();
    wait_for_applied(
        "the straggler to reconcile",
        &[node(&nodes, straggler)],
        std::slice::from_ref(&entry),
    )
    .await;

    shutdown_cluster(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_recovers_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("raft.state");
    let slot = Arc::new(OnceLock::new());
    let up = Arc::new(AtomicBool::new(true));

    // First life: a single-node cluster commits two entries.
    let first = spawn_node(
        1,
        HashMap::new(),
        FilePersister::new(&state_path).unwrap(),
        &slot,
        Arc::clone(&up),
    );
    let first_ref = &first;
    let e1 = wait_for("first leadership", || async move {
        first_ref
            .handle
            .apply_command(Bytes::from_static(b"one"))
            .await
            .ok()
    })
    .await;
    let e2 = first
        .handle
        .apply_command(Bytes::from_static(b"two"))
        .await
        .unwrap();
    wait_for("both entries to apply", || async move {
        (first_ref.applied_entries().len() == 2).then_some(())
    })
    .await;
    let first_term = first.handle.status().await.unwrap().term;
    first.stop().await.unwrap();

    // Second life: the log and term survive the restart.
    let slot = Arc::new(OnceLock::new());
    let second = spawn_node(
        1,
        HashMap::new(),
        FilePersister::new(&state_path).unwrap(),
        &slot,
        up,
    );
    let restored = second.handle.status().await.unwrap();
    assert_eq!(restored.last_log_id, 2);
    assert!(restored.term >= first_term);

    // Recovered entries only commit beneath the next current-term append.
    let second_ref = &second;
    let e3 = wait_for("leadership after restart", || async move {
        second_ref
            .handle
            .apply_command(Bytes::from_static(b"three"))
            .await
            .ok()
    })
    .await;
    wait_for("the whole log to re-apply in order", || async move {
        (second_ref.applied_entries().len() == 3).then_some(())
    })
    .await;
    let applied = second.applied_entries();
    assert_eq!(
        applied.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(applied[0].data, e1.data);
    assert_eq!(applied[1].data, e2.data);
    assert_eq!(applied[2].data, e3.data);

    second.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_five_node_cluster_survives_two_failures() {
    let nodes = build_cluster(5);
    let leader = wait_for_leader(&nodes).await;

    // Drop two followers; three nodes are still a quorum of five.
    let away: Vec<NodeId> = nodes
        .iter()
        .filter(|n| n.id != leader)
        .take(2)
        .map(|n| n.id)
        .collect();
    for id in &away {
        node(&nodes, *id).partition();
    }

    let entry = node(&nodes, leader)
        .handle
        .apply_command(Bytes::from_static(b"still alive"))
        .await
        .unwrap();
    let quorum: Vec<&TestNode> = nodes.iter().filter(|n| !away.contains(&n.id)).collect();
    wait_for_applied(
        "the remaining quorum to apply",
        &quorum,
        std::slice::from_ref(&entry),
    )
    .await;

    shutdown_cluster(nodes).await;
}

mod common;

use std::{sync::Arc, time::Duration};

use gossip_hashgraph::{
    config::NodeConfig,
    error::ConsensusError,
    events::NodeEvent,
    state::NodeState,
    store::{InMemoryStore, Store},
};

use common::{
    TestPeer, has_transactions, peer_set, prefix_consistent, shutdown_all, signers,
    spawn_network, spawn_node, wait_until,
};

const CONVERGENCE: Duration = Duration::from_secs(30);

fn payloads(prefix: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("{prefix}-{i}").into_bytes())
        .collect()
}

async fn submit(peer: &TestPeer, txs: &[Vec<u8>]) {
    for tx in txs {
        peer.proxy.submit_tx(tx.clone()).await.expect("submitted");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_nodes_commit_the_same_blocks() {
    let (_network, _signers, peers) = spawn_network(4).await;

    let mut expected = Vec::new();
    for (i, peer) in peers.iter().enumerate() {
        let txs = payloads(&format!("node{i}"), 5);
        submit(peer, &txs).await;
        expected.extend(txs);
    }

    for peer in &peers {
        let proxy = Arc::clone(&peer.proxy);
        assert!(
            wait_until(CONVERGENCE, || has_transactions(&proxy, &expected)).await,
            "node {} committed {} of {} transactions",
            peer.node.id(),
            proxy.committed_transactions().len(),
            expected.len()
        );
    }

    let reference = peers[0].proxy.committed_blocks();
    for peer in &peers[1..] {
        let blocks = peer.proxy.committed_blocks();
        let shared = reference.len().min(blocks.len());
        assert_eq!(blocks[..shared], reference[..shared]);
    }
    // Every transaction is delivered exactly once.
    let committed = peers[0].proxy.committed_transactions();
    for tx in &expected {
        assert_eq!(committed.iter().filter(|c| *c == tx).count(), 1);
    }

    let stats = peers[0].node.stats();
    assert_eq!(stats.state, NodeState::Babbling);
    assert!(stats.last_consensus_round.is_some());
    assert!(stats.last_committed_block >= 0);
    assert_eq!(stats.peers, 4);
    assert!(peers[0].store.last_block_index().await.unwrap() >= 0);

    shutdown_all(&peers).await;
    for peer in peers {
        assert!(peer.handle.await.unwrap().is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_is_idempotent() {
    let (_network, _signers, peers) = spawn_network(2).await;
    let mut events = peers[0].node.subscribe();

    peers[0].node.shutdown().await;
    peers[0].node.shutdown().await;
    assert_eq!(peers[0].node.state(), NodeState::Shutdown);

    let mut shutdowns = 0;
    while let Ok((id, event)) = events.try_recv() {
        if id == peers[0].node.id()
            && matches!(
                event,
                NodeEvent::StateChanged {
                    to: NodeState::Shutdown,
                    ..
                }
            )
        {
            shutdowns += 1;
        }
    }
    assert_eq!(shutdowns, 1);
    assert!(matches!(
        peers[0].node.leave().await,
        Err(ConsensusError::InvalidState(NodeState::Shutdown))
    ));

    shutdown_all(&peers).await;
    for peer in peers {
        assert!(peer.handle.await.unwrap().is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_cannot_be_started_twice() {
    let (_network, _signers, peers) = spawn_network(1).await;
    assert!(wait_until(CONVERGENCE, || peers[0].node.state() == NodeState::Babbling).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peers[0].node.run().await.is_err());
    shutdown_all(&peers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_member_decides_alone() {
    let (_network, _signers, peers) = spawn_network(1).await;
    let txs = payloads("solo", 3);
    submit(&peers[0], &txs).await;

    let proxy = Arc::clone(&peers[0].proxy);
    assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, &txs)).await);
    assert_eq!(proxy.committed_transactions(), txs);

    shutdown_all(&peers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_commit_is_retried_in_order() {
    let (_network, _signers, peers) = spawn_network(4).await;
    let mut events = peers[1].node.subscribe();
    peers[1].proxy.fail_next_commits(2);

    let txs = payloads("retry", 4);
    submit(&peers[0], &txs).await;

    for peer in &peers {
        let proxy = Arc::clone(&peer.proxy);
        assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, &txs)).await);
    }
    let blocks = peers[1].proxy.committed_blocks();
    for (expected, block) in blocks.iter().enumerate() {
        assert_eq!(block.index, expected as i64);
    }
    assert_eq!(
        peers[1].proxy.committed_transactions(),
        peers[0].proxy.committed_transactions()[..peers[1].proxy.committed_transactions().len()]
    );

    let mut failures = 0;
    while let Ok((id, event)) = events.try_recv() {
        if id == peers[1].node.id() && matches!(event, NodeEvent::CommitFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 2);

    shutdown_all(&peers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_member_leaves_and_the_rest_carry_on() {
    let (_network, _signers, peers) = spawn_network(4).await;
    let warmup = payloads("before", 2);
    submit(&peers[0], &warmup).await;
    for peer in &peers {
        let proxy = Arc::clone(&peer.proxy);
        assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, &warmup)).await);
    }

    let leaving = peers[3].node.clone();
    tokio::time::timeout(CONVERGENCE, leaving.leave())
        .await
        .expect("leave finished in time")
        .expect("leave accepted");
    assert_eq!(leaving.state(), NodeState::Shutdown);

    for peer in &peers[..3] {
        let node = peer.node.clone();
        assert!(wait_until(CONVERGENCE, || node.peers().len() == 3).await);
        let sets = node.peer_sets();
        assert_eq!(sets.len(), 2);
        assert!(!sets[1].1.contains(leaving.pub_key()));
    }

    let after = payloads("after", 3);
    submit(&peers[1], &after).await;
    for peer in &peers[..3] {
        let proxy = Arc::clone(&peer.proxy);
        assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, &after)).await);
    }

    shutdown_all(&peers).await;
    for peer in peers {
        assert!(peer.handle.await.unwrap().is_ok());
    }
}

/// Ask `peer` to leave, retrying while an earlier membership change is
/// still pending.
async fn leave_when_idle(peer: &TestPeer) {
    let attempt = async {
        loop {
            match peer.node.leave().await {
                Err(ConsensusError::MembershipChangeInProgress) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                result => return result,
            }
        }
    };
    tokio::time::timeout(CONVERGENCE, attempt)
        .await
        .expect("leave finished in time")
        .expect("leave accepted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_successive_leaves_drain_the_network() {
    let (_network, _signers, peers) = spawn_network(4).await;
    let warmup = payloads("warmup", 2);
    submit(&peers[0], &warmup).await;
    for peer in &peers {
        let proxy = Arc::clone(&peer.proxy);
        assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, &warmup)).await);
    }

    for (i, leaver) in peers.iter().enumerate() {
        leave_when_idle(leaver).await;
        assert_eq!(leaver.node.state(), NodeState::Shutdown);

        let remaining = &peers[i + 1..];
        for peer in remaining {
            let node = peer.node.clone();
            assert!(
                wait_until(CONVERGENCE, || node.peers().len() == remaining.len()).await,
                "node {} still gossips with {} peers",
                node.id(),
                node.peers().len()
            );
        }

        let Some(first) = remaining.first() else {
            break;
        };
        let txs = payloads(&format!("with-{}", remaining.len()), 2);
        submit(first, &txs).await;
        for peer in remaining {
            let proxy = Arc::clone(&peer.proxy);
            assert!(
                wait_until(CONVERGENCE, || has_transactions(&proxy, &txs)).await,
                "node {} stalled with {} members",
                peer.node.id(),
                remaining.len()
            );
        }
    }

    for peer in peers {
        assert!(peer.handle.await.unwrap().is_ok());
    }
}

/// Keep transactions flowing into `peer` until it has decided `round`.
async fn drive_to_round(peer: &TestPeer, round: i64) -> bool {
    let deadline = tokio::time::Instant::now() + CONVERGENCE;
    let mut filler = 0;
    while tokio::time::Instant::now() < deadline {
        if peer.node.stats().last_consensus_round >= Some(round) {
            return true;
        }
        peer.node
            .submit_transaction(format!("filler-{filler}").into_bytes());
        filler += 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_peer_joins_and_fast_forwards() {
    let (network, signers, founders) = spawn_network(4).await;
    // Join well after genesis, so that the frame carries real history.
    assert!(drive_to_round(&founders[0], 20).await);

    let joiner_key = common::signers(5).remove(4);
    let joiner = spawn_node(
        &network,
        joiner_key.clone(),
        peer_set(&signers),
        4,
        NodeConfig::test_config(),
        Arc::new(InMemoryStore::new()),
    )
    .await;
    assert_ne!(joiner.node.state(), NodeState::Babbling);

    let node = joiner.node.clone();
    assert!(
        wait_until(CONVERGENCE, || node.state() == NodeState::Babbling).await,
        "joiner stuck in {}",
        node.state()
    );
    assert!(joiner.node.peers().contains(joiner_key.address().as_slice()));
    let frame = joiner.store.frame().await.unwrap().expect("frame installed");
    assert!(frame.round >= 10);

    for peer in &founders {
        let node = peer.node.clone();
        assert!(wait_until(CONVERGENCE, || node.peers().len() == 5).await);
    }

    let after = payloads("after-join", 4);
    submit(&founders[1], &after).await;
    submit(&joiner, &payloads("from-joiner", 1)).await;
    let mut expected = after.clone();
    expected.extend(payloads("from-joiner", 1));

    let mut everyone: Vec<&TestPeer> = founders.iter().collect();
    everyone.push(&joiner);
    for peer in &everyone {
        let proxy = Arc::clone(&peer.proxy);
        assert!(
            wait_until(CONVERGENCE, || has_transactions(&proxy, &expected)).await,
            "node {} is missing transactions",
            peer.node.id()
        );
    }

    // Every block the joiner committed is a founder block.
    let joined = joiner.proxy.committed_blocks();
    let last = joined.last().expect("joiner committed blocks").index;
    for peer in &founders {
        let proxy = Arc::clone(&peer.proxy);
        assert!(
            wait_until(CONVERGENCE, || {
                proxy.committed_blocks().last().is_some_and(|b| b.index >= last)
            })
            .await
        );
        let reference = proxy.committed_blocks();
        for block in &joined {
            assert_eq!(
                reference.iter().find(|b| b.index == block.index),
                Some(block),
                "block {} differs on node {}",
                block.index,
                peer.node.id()
            );
        }
    }

    // From its first consensus event on, the joiner orders like the founders.
    let ordered = joiner.node.consensus_events();
    let first = ordered.first().expect("joiner decided rounds");
    for peer in &founders {
        let reference = peer.node.consensus_events();
        let start = reference
            .iter()
            .position(|hash| hash == first)
            .expect("founders ordered the joiner's first event");
        assert!(prefix_consistent(&reference[start..], &ordered));
    }

    shutdown_all(&founders).await;
    joiner.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_bootstraps_from_store() {
    let signers = signers(1);
    let genesis = peer_set(&signers);
    let network = gossip_hashgraph::transport::InmemNetwork::new();
    let store = Arc::new(InMemoryStore::new());
    let config = NodeConfig::builder()
        .test_preset()
        .with_bootstrap(true)
        .build()
        .unwrap();

    let first = spawn_node(
        &network,
        signers[0].clone(),
        genesis.clone(),
        0,
        config.clone(),
        Arc::clone(&store),
    )
    .await;
    let txs = payloads("persisted", 3);
    submit(&first, &txs).await;
    let proxy = Arc::clone(&first.proxy);
    let node = first.node.clone();
    assert!(
        wait_until(CONVERGENCE, || {
            has_transactions(&proxy, &txs)
                && proxy.committed_blocks().last().map(|b| b.index)
                    == Some(node.last_committed_block())
        })
        .await
    );
    first.node.shutdown().await;
    assert!(first.handle.await.unwrap().is_ok());
    let committed = first.node.last_committed_block();
    let consensus = first.node.consensus_events();

    store.reopen();
    let second = spawn_node(
        &network,
        signers[0].clone(),
        genesis,
        0,
        config,
        Arc::clone(&store),
    )
    .await;
    assert_eq!(second.node.last_committed_block(), committed);
    let restored = second.node.consensus_events();
    assert!(!restored.is_empty());
    assert!(prefix_consistent(&restored, &consensus));
    // Already committed blocks are not handed to the application again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        second
            .proxy
            .committed_blocks()
            .iter()
            .all(|block| block.index > committed)
    );

    second.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_founder_restarts_after_a_join() {
    let network = gossip_hashgraph::transport::InmemNetwork::new();
    let signers = signers(4);
    let genesis = peer_set(&signers);
    let config = NodeConfig::builder()
        .test_preset()
        .with_bootstrap(true)
        .build()
        .unwrap();
    let mut founders = Vec::new();
    for (i, signer) in signers.iter().enumerate() {
        founders.push(
            spawn_node(
                &network,
                signer.clone(),
                genesis.clone(),
                i,
                config.clone(),
                Arc::new(InMemoryStore::new()),
            )
            .await,
        );
    }

    let joiner = spawn_node(
        &network,
        common::signers(5).remove(4),
        genesis.clone(),
        4,
        NodeConfig::test_config(),
        Arc::new(InMemoryStore::new()),
    )
    .await;
    let node = joiner.node.clone();
    assert!(wait_until(CONVERGENCE, || node.state() == NodeState::Babbling).await);

    // The joiner's own events end up in every founder's store.
    let from_joiner = payloads("from-joiner", 2);
    submit(&joiner, &from_joiner).await;
    for peer in &founders {
        let proxy = Arc::clone(&peer.proxy);
        assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, &from_joiner)).await);
    }

    let first = founders.remove(1);
    let proxy = Arc::clone(&first.proxy);
    let node = first.node.clone();
    assert!(
        wait_until(CONVERGENCE, || {
            proxy.committed_blocks().last().map(|b| b.index) == Some(node.last_committed_block())
        })
        .await
    );
    first.node.shutdown().await;
    assert!(first.handle.await.unwrap().is_ok());
    let committed = first.node.last_committed_block();
    let sets = first.node.peer_sets();
    assert_eq!(sets.len(), 2);

    first.store.reopen();
    let stored = first.store.peer_sets().await.unwrap();
    assert!(stored.contains_key(&sets[1].0));
    let second = spawn_node(
        &network,
        signers[1].clone(),
        genesis,
        1,
        config,
        Arc::clone(&first.store),
    )
    .await;
    assert_eq!(second.node.last_committed_block(), committed);
    assert_eq!(second.node.peer_sets(), sets);

    let after = payloads("after-restart", 2);
    submit(&founders[0], &after).await;
    for peer in founders.iter().chain([&second, &joiner]) {
        let proxy = Arc::clone(&peer.proxy);
        assert!(
            wait_until(CONVERGENCE, || has_transactions(&proxy, &after)).await,
            "node {} is missing transactions",
            peer.node.id()
        );
    }

    shutdown_all(&founders).await;
    second.node.shutdown().await;
    joiner.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitioned_member_catches_up_after_heal() {
    let (network, _signers, peers) = spawn_network(4).await;
    network.partition(&common::addr(3));

    let txs = payloads("partition", 3);
    submit(&peers[0], &txs).await;
    let txs = &txs;
    let online = futures::future::join_all(peers[..3].iter().map(|peer| {
        let proxy = Arc::clone(&peer.proxy);
        async move { wait_until(CONVERGENCE, || has_transactions(&proxy, txs)).await }
    }))
    .await;
    assert!(online.into_iter().all(|reached| reached));
    assert!(peers[3].proxy.committed_transactions().is_empty());
    assert!(peers[3].node.stats().sync_errors > 0);

    network.heal(&common::addr(3));
    let proxy = Arc::clone(&peers[3].proxy);
    assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, txs)).await);
    assert_eq!(
        peers[3].proxy.committed_blocks(),
        peers[0].proxy.committed_blocks()[..peers[3].proxy.committed_blocks().len()]
    );

    shutdown_all(&peers).await;
}

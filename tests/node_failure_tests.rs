mod common;

use std::{sync::Arc, time::Duration};

use gossip_hashgraph::{
    config::NodeConfig,
    error::ConsensusError,
    event::Event,
    events::NodeEvent,
    node::Node,
    protos::hashgraph::v1::{
        EagerSyncRequest, EagerSyncResponse, EventBody, FastForwardRequest, FastForwardResponse,
        JoinRequest, JoinResponse, SyncRequest, SyncResponse,
    },
    proxy::InmemAppProxy,
    state::NodeState,
    store::{InMemoryStore, Store},
    transport::{InmemNetwork, InmemTransport, Rpc, Transport},
};
use tokio::sync::mpsc;

use common::{
    TestPeer, addr, has_transactions, peer_set, shutdown_all, signers, spawn_network,
    spawn_node, wait_for_event, wait_until,
};

const CONVERGENCE: Duration = Duration::from_secs(30);

async fn warm_up(peers: &[TestPeer]) {
    let txs: Vec<Vec<u8>> = (0..2).map(|i| format!("warmup-{i}").into_bytes()).collect();
    for tx in &txs {
        peers[0].proxy.submit_tx(tx.clone()).await.expect("submitted");
    }
    for peer in peers {
        let proxy = Arc::clone(&peer.proxy);
        assert!(wait_until(CONVERGENCE, || has_transactions(&proxy, &txs)).await);
    }
}

fn short_join_timeout() -> NodeConfig {
    NodeConfig::builder()
        .test_preset()
        .with_join_timeout(Duration::from_millis(300))
        .build()
        .unwrap()
}

/// In-memory transport whose fast-forward requests never get an answer.
struct NoFramesTransport(InmemTransport);

#[async_trait::async_trait]
impl Transport for NoFramesTransport {
    fn local_addr(&self) -> &str {
        self.0.local_addr()
    }

    async fn listen(&self) -> Result<mpsc::Receiver<Rpc>, ConsensusError> {
        self.0.listen().await
    }

    async fn sync(&self, target: &str, req: SyncRequest) -> Result<SyncResponse, ConsensusError> {
        self.0.sync(target, req).await
    }

    async fn eager_sync(
        &self,
        target: &str,
        req: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, ConsensusError> {
        self.0.eager_sync(target, req).await
    }

    async fn fast_forward(
        &self,
        target: &str,
        _req: FastForwardRequest,
    ) -> Result<FastForwardResponse, ConsensusError> {
        Err(ConsensusError::PeerUnreachable(target.to_string()))
    }

    async fn join(&self, target: &str, req: JoinRequest) -> Result<JoinResponse, ConsensusError> {
        self.0.join(target, req).await
    }

    async fn close(&self) -> Result<(), ConsensusError> {
        self.0.close().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_times_out_without_running_peers() {
    let network = InmemNetwork::new();
    let founders = signers(4);
    let joiner = spawn_node(
        &network,
        signers(5).remove(4),
        peer_set(&founders),
        4,
        short_join_timeout(),
        Arc::new(InMemoryStore::new()),
    )
    .await;

    let result = tokio::time::timeout(CONVERGENCE, joiner.handle)
        .await
        .expect("run returned")
        .unwrap();
    assert!(matches!(result, Err(ConsensusError::JoinTimeout)));
    assert_eq!(joiner.node.state(), NodeState::Shutdown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_with_a_members_key_is_rejected() {
    let (network, signers, founders) = spawn_network(4).await;
    warm_up(&founders).await;

    // A second process holding founder 3's key, unaware it is a member.
    let impostor = spawn_node(
        &network,
        signers[3].clone(),
        peer_set(&signers[..3]),
        5,
        NodeConfig::test_config(),
        Arc::new(InMemoryStore::new()),
    )
    .await;

    let result = tokio::time::timeout(CONVERGENCE, impostor.handle)
        .await
        .expect("run returned")
        .unwrap();
    assert!(matches!(result, Err(ConsensusError::JoinRejected(_))));
    assert_eq!(impostor.node.state(), NodeState::Shutdown);
    for peer in &founders {
        assert_eq!(peer.node.peers().len(), 4);
    }

    shutdown_all(&founders).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitioned_leave_times_out() {
    let network = InmemNetwork::new();
    let signers = signers(4);
    let genesis = peer_set(&signers);
    let mut peers = Vec::new();
    for (i, signer) in signers.iter().enumerate() {
        let config = if i == 3 {
            short_join_timeout()
        } else {
            NodeConfig::test_config()
        };
        peers.push(
            spawn_node(
                &network,
                signer.clone(),
                genesis.clone(),
                i,
                config,
                Arc::new(InMemoryStore::new()),
            )
            .await,
        );
    }
    warm_up(&peers).await;

    network.partition(&addr(3));
    let result = peers[3].node.leave().await;
    assert!(matches!(result, Err(ConsensusError::LeaveTimeout)));
    assert_eq!(peers[3].node.state(), NodeState::Babbling);

    network.heal(&addr(3));
    shutdown_all(&peers).await;
    for peer in peers {
        assert!(peer.handle.await.unwrap().is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_catch_up_failure_is_published_and_retried() {
    let (network, signers, founders) = spawn_network(4).await;
    warm_up(&founders).await;

    let config = NodeConfig {
        moniker: "node4".to_string(),
        ..NodeConfig::builder()
            .test_preset()
            .with_fast_forward(2, Duration::from_millis(10))
            .build()
            .unwrap()
    };
    let transport = NoFramesTransport(network.transport(addr(4), config.timeout, config.join_timeout));
    let joiner = Node::new(
        config,
        common::signers(5).remove(4),
        peer_set(&signers),
        Arc::new(InMemoryStore::new()),
        Arc::new(transport),
        Arc::new(InmemAppProxy::new()),
    )
    .await
    .expect("node created");
    let mut events = joiner.subscribe();
    let runner = joiner.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let failure = wait_for_event(&mut events, CONVERGENCE, |event| {
        matches!(event, NodeEvent::CatchUpFailed { .. })
    })
    .await;
    assert!(matches!(failure, Some(NodeEvent::CatchUpFailed { attempts: 2, .. })));
    // Not fatal: the node keeps trying.
    let again = wait_for_event(&mut events, CONVERGENCE, |event| {
        matches!(event, NodeEvent::CatchUpFailed { .. })
    })
    .await;
    assert!(matches!(again, Some(NodeEvent::CatchUpFailed { attempts: 4, .. })));
    assert_eq!(joiner.state(), NodeState::CatchingUp);

    joiner.shutdown().await;
    assert!(handle.await.unwrap().is_ok());
    shutdown_all(&founders).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pushed_fork_is_published_as_equivocation() {
    let (network, signers, peers) = spawn_network(4).await;
    warm_up(&peers).await;
    let mut events = peers[0].node.subscribe();

    // A second genesis event by founder 1.
    let forger = &signers[1];
    let fork = Event::sign(
        EventBody {
            creator: forger.address().to_vec(),
            self_parent: None,
            other_parent: None,
            transactions: vec![b"double".to_vec()],
            internal_transactions: vec![],
            index: 0,
            timestamp: 1,
        },
        forger,
    )
    .unwrap();
    let outsider = network.transport("inmem://outsider", Duration::from_secs(1), Duration::from_secs(1));
    let response = outsider
        .eager_sync(
            &addr(0),
            EagerSyncRequest {
                from_id: 0,
                events: vec![fork.to_wire()],
            },
        )
        .await
        .unwrap();
    assert!(!response.success);

    let detected = wait_for_event(&mut events, CONVERGENCE, |event| {
        matches!(event, NodeEvent::EquivocationDetected { .. })
    })
    .await;
    match detected {
        Some(NodeEvent::EquivocationDetected { event, .. }) => assert_eq!(event, fork.hash()),
        other => panic!("expected an equivocation, got {other:?}"),
    }
    assert_eq!(peers[0].node.state(), NodeState::Babbling);

    shutdown_all(&peers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_failure_stops_the_node_with_an_error() {
    let (_network, _signers, mut peers) = spawn_network(2).await;
    warm_up(&peers).await;

    let broken = peers.remove(0);
    broken.store.close().await.unwrap();
    broken.node.submit_transaction(b"after-close".to_vec());

    let result = tokio::time::timeout(CONVERGENCE, broken.handle)
        .await
        .expect("run returned")
        .unwrap();
    match result {
        Err(err) => {
            assert!(err.is_fatal());
            assert!(matches!(err, ConsensusError::Store(_)));
        }
        Ok(()) => panic!("run returned Ok after a store failure"),
    }
    assert_eq!(broken.node.state(), NodeState::Shutdown);

    shutdown_all(&peers).await;
}

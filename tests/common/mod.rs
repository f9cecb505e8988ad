#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use alloy::{primitives::B256, signers::local::PrivateKeySigner};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
    sync::broadcast::{Receiver, error::RecvError},
    task::JoinHandle,
    time::Instant,
};

use gossip_hashgraph::{
    config::NodeConfig,
    core::Core,
    error::ConsensusError,
    events::NodeEvent,
    node::Node,
    peers::{Peer, PeerSet},
    proxy::InmemAppProxy,
    store::InMemoryStore,
    transport::{InmemNetwork, InmemTransport},
};

pub type TestNode = Node<InMemoryStore, InmemTransport, InmemAppProxy>;

/// Deterministic keys, so that runs are reproducible.
pub fn signers(n: usize) -> Vec<PrivateKeySigner> {
    (0..n)
        .map(|i| PrivateKeySigner::from_bytes(&B256::repeat_byte(i as u8 + 1)).expect("valid key"))
        .collect()
}

pub fn addr(i: usize) -> String {
    format!("inmem://node{i}")
}

pub fn peer(signer: &PrivateKeySigner, i: usize) -> Peer {
    Peer::new(signer.address().to_vec(), addr(i), format!("node{i}"))
}

pub fn peer_set(signers: &[PrivateKeySigner]) -> PeerSet {
    PeerSet::new(
        signers
            .iter()
            .enumerate()
            .map(|(i, signer)| peer(signer, i))
            .collect(),
    )
}

/// Founding cores that have created their genesis events.
pub fn cores(n: usize) -> Vec<Core> {
    let signers = signers(n);
    let genesis = peer_set(&signers);
    signers
        .into_iter()
        .map(|signer| {
            let mut core = Core::new(signer, genesis.clone());
            core.init().expect("genesis event");
            core
        })
        .collect()
}

/// One pull: `a` asks `b` for what it lacks and records the sync.
pub fn pull(cores: &mut [Core], a: usize, b: usize) -> Result<(), ConsensusError> {
    let known = cores[a].known_events();
    let diff = cores[b].event_diff(&known, usize::MAX);
    cores[a].sync(diff)?;
    cores[a].run_consensus()?;
    Ok(())
}

/// Random pairwise gossip driven by a seeded RNG. A transaction is submitted
/// every `tx_every` steps, named after the step.
pub fn simulate(cores: &mut [Core], rng: &mut StdRng, steps: usize, tx_every: usize) {
    let n = cores.len();
    for step in 0..steps {
        let a = rng.gen_range(0..n);
        let mut b = rng.gen_range(0..n - 1);
        if b >= a {
            b += 1;
        }
        if tx_every > 0 && step % tx_every == 0 {
            cores[a].add_transactions(vec![format!("tx-{step}").into_bytes()]);
        }
        pull(cores, a, b).expect("honest gossip never fails");
    }
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Whether one sequence is a prefix of the other.
pub fn prefix_consistent<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    let len = a.len().min(b.len());
    a[..len] == b[..len]
}

pub struct TestPeer {
    pub node: TestNode,
    pub proxy: Arc<InmemAppProxy>,
    pub store: Arc<InMemoryStore>,
    pub handle: JoinHandle<Result<(), ConsensusError>>,
}

pub async fn spawn_node(
    network: &InmemNetwork,
    signer: PrivateKeySigner,
    genesis: PeerSet,
    i: usize,
    config: NodeConfig,
    store: Arc<InMemoryStore>,
) -> TestPeer {
    let config = NodeConfig {
        moniker: format!("node{i}"),
        ..config
    };
    let transport = Arc::new(network.transport(addr(i), config.timeout, config.join_timeout));
    let proxy = Arc::new(InmemAppProxy::new());
    let node = Node::new(
        config,
        signer,
        genesis,
        Arc::clone(&store),
        transport,
        Arc::clone(&proxy),
    )
    .await
    .expect("node created");

    let runner = node.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    TestPeer {
        node,
        proxy,
        store,
        handle,
    }
}

/// Start `n` founding members on a fresh in-process network.
pub async fn spawn_network(n: usize) -> (InmemNetwork, Vec<PrivateKeySigner>, Vec<TestPeer>) {
    let network = InmemNetwork::new();
    let signers = signers(n);
    let genesis = peer_set(&signers);
    let mut peers = Vec::with_capacity(n);
    for (i, signer) in signers.iter().enumerate() {
        peers.push(
            spawn_node(
                &network,
                signer.clone(),
                genesis.clone(),
                i,
                NodeConfig::test_config(),
                Arc::new(InMemoryStore::new()),
            )
            .await,
        );
    }
    (network, signers, peers)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait for the first published event that satisfies `matches`.
pub async fn wait_for_event(
    events: &mut Receiver<(u32, NodeEvent)>,
    timeout: Duration,
    matches: impl Fn(&NodeEvent) -> bool,
) -> Option<NodeEvent> {
    let next = async {
        loop {
            match events.recv().await {
                Ok((_, event)) if matches(&event) => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, next).await.ok().flatten()
}

pub fn has_transactions(proxy: &InmemAppProxy, expected: &[Vec<u8>]) -> bool {
    let committed = proxy.committed_transactions();
    expected.iter().all(|tx| committed.contains(tx))
}

pub async fn shutdown_all(peers: &[TestPeer]) {
    futures::future::join_all(peers.iter().map(|peer| peer.node.shutdown())).await;
}

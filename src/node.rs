//! A consensus participant.
//!
//! A [`Node`] owns a [`Core`] behind a mutex and drives it through its
//! lifecycle: it joins the network when it is not a founding member, catches
//! up by installing a frame from a peer, then gossips on every heartbeat,
//! runs consensus and commits the resulting blocks to the application. The
//! core lock is never held across an `.await`; network and store I/O happen
//! outside it.
//!
//! Peer requests are answered by handlers in [`crate::node_rpc`].

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use alloy::signers::local::PrivateKeySigner;
use futures::TryStreamExt;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::{
    sync::{Semaphore, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    block::{Block, InternalTransactionReceipt},
    config::NodeConfig,
    core::Core,
    error::ConsensusError,
    event::{Event, EventHash},
    events::{BroadcastEventBus, NodeEvent, NodeEventBus},
    hashgraph::Hashgraph,
    peers::{Peer, PeerSet},
    protos::hashgraph::v1::{
        EagerSyncRequest, FastForwardRequest, InternalTransaction, JoinRequest, SyncRequest,
        TransactionType,
    },
    proxy::AppProxy,
    state::{NodeState, StateCell},
    stats::{NodeStats, SyncCounters},
    store::Store,
    transport::Transport,
    utils::peer_id,
};

/// Upper bound for the delay between fast-forward attempts.
const MAX_FAST_FORWARD_BACKOFF: Duration = Duration::from_secs(5);

type ReceiptWaiters = HashMap<[u8; 32], Vec<oneshot::Sender<InternalTransactionReceipt>>>;

pub(crate) struct NodeInner<S, T, P, E> {
    pub(crate) id: u32,
    pub(crate) pub_key: Vec<u8>,
    pub(crate) config: NodeConfig,
    pub(crate) core: Mutex<Core>,
    pub(crate) state: StateCell,
    pub(crate) peers: RwLock<Arc<PeerSet>>,
    pub(crate) store: Arc<S>,
    pub(crate) transport: Arc<T>,
    pub(crate) proxy: Arc<P>,
    pub(crate) event_bus: E,
    gossip_permits: Arc<Semaphore>,
    commit_lock: tokio::sync::Mutex<()>,
    last_committed_block: AtomicI64,
    pub(crate) membership_waiters: Mutex<ReceiptWaiters>,
    shutdown_tx: watch::Sender<bool>,
    fatal: Mutex<Option<ConsensusError>>,
    pub(crate) counters: SyncCounters,
    started: AtomicBool,
}

pub struct Node<S, T, P, E = BroadcastEventBus>
where
    S: Store,
    T: Transport,
    P: AppProxy,
    E: NodeEventBus,
{
    pub(crate) inner: Arc<NodeInner<S, T, P, E>>,
}

impl<S, T, P, E> Clone for Node<S, T, P, E>
where
    S: Store,
    T: Transport,
    P: AppProxy,
    E: NodeEventBus,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, T, P> Node<S, T, P, BroadcastEventBus>
where
    S: Store,
    T: Transport,
    P: AppProxy,
{
    pub async fn new(
        config: NodeConfig,
        signer: PrivateKeySigner,
        genesis: PeerSet,
        store: Arc<S>,
        transport: Arc<T>,
        proxy: Arc<P>,
    ) -> Result<Self, ConsensusError> {
        Self::new_with_event_bus(
            config,
            signer,
            genesis,
            store,
            transport,
            proxy,
            BroadcastEventBus::default(),
        )
        .await
    }
}

impl<S, T, P, E> Node<S, T, P, E>
where
    S: Store,
    T: Transport,
    P: AppProxy,
    E: NodeEventBus,
{
    /// Build a node. Founding members (present in `genesis`) start babbling;
    /// anyone else starts by asking a genesis peer to join.
    pub async fn new_with_event_bus(
        config: NodeConfig,
        signer: PrivateKeySigner,
        genesis: PeerSet,
        store: Arc<S>,
        transport: Arc<T>,
        proxy: Arc<P>,
        event_bus: E,
    ) -> Result<Self, ConsensusError> {
        config.validate()?;
        let pub_key = signer.address().to_vec();
        let id = peer_id(&pub_key);

        let mut core = Core::new(signer, genesis.clone());
        let mut initial_state = if genesis.contains(&pub_key) {
            NodeState::Babbling
        } else {
            NodeState::Joining
        };
        let mut last_committed_block = -1;

        if config.bootstrap
            && let Some(committed) = Self::bootstrap(&mut core, store.as_ref()).await?
        {
            info!(node = id, last_block = committed, "Bootstrapped from store");
            last_committed_block = committed;
            initial_state = NodeState::Babbling;
        }
        if initial_state == NodeState::Babbling {
            core.init()?;
        }
        for event in core.take_unpersisted() {
            store.set_event(event).await?;
        }

        let peers = if initial_state == NodeState::Babbling {
            core.latest_peer_set()
        } else {
            Arc::new(genesis)
        };
        let (shutdown_tx, _) = watch::channel(false);

        info!(node = id, state = %initial_state, peers = peers.len(), "Node created");
        Ok(Self {
            inner: Arc::new(NodeInner {
                id,
                pub_key,
                core: Mutex::new(core),
                state: StateCell::new(initial_state),
                peers: RwLock::new(peers),
                store,
                transport,
                proxy,
                event_bus,
                gossip_permits: Arc::new(Semaphore::new(config.max_pool)),
                commit_lock: tokio::sync::Mutex::new(()),
                last_committed_block: AtomicI64::new(last_committed_block),
                membership_waiters: Mutex::new(HashMap::new()),
                shutdown_tx,
                fatal: Mutex::new(None),
                counters: SyncCounters::default(),
                started: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Rebuild the hashgraph from persisted state. Returns the index of the
    /// last block already committed, or `None` if the store is empty.
    ///
    /// Membership changes are decided again while replaying; the peer sets
    /// and consensus round on record must come out the same.
    async fn bootstrap(core: &mut Core, store: &S) -> Result<Option<i64>, ConsensusError> {
        let frame = store.frame().await?;
        let events: Vec<Event> = store.stream_events().try_collect().await?;
        if frame.is_none() && events.is_empty() {
            return Ok(None);
        }

        if let Some(frame) = frame {
            core.fast_forward(Hashgraph::from_trusted_frame(&frame)?);
        }
        let replayed = events.len();
        core.replay(events)?;
        core.run_consensus()?;
        // Replayed events are already persisted.
        core.take_unpersisted();

        let recorded = store.peer_sets().await?;
        let rebuilt = core.hashgraph().peer_sets();
        for (round, peers) in &recorded {
            if rebuilt.get(round).map(|rebuilt| &**rebuilt) != Some(peers) {
                return Err(ConsensusError::InvariantViolation(format!(
                    "stored peer set for round {round} was not rebuilt by replay"
                )));
            }
        }
        let peer_sets = rebuilt.len();
        let last_round = core.hashgraph().last_consensus_round();
        if let Some(stored) = store.last_consensus_round().await?
            && last_round < Some(stored)
        {
            warn!(stored, replayed = ?last_round, "Replay stopped short of the stored consensus round");
        }

        let committed = store.last_block_index().await?;
        core.skip_blocks_through(committed);
        debug!(
            events = replayed,
            peer_sets,
            last_round = ?last_round,
            last_block = committed,
            "Replayed stored events"
        );
        Ok(Some(committed))
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn pub_key(&self) -> &[u8] {
        &self.inner.pub_key
    }

    pub fn local_peer(&self) -> Peer {
        Peer::new(
            self.inner.pub_key.clone(),
            self.inner.transport.local_addr(),
            self.inner.config.moniker.clone(),
        )
    }

    pub fn state(&self) -> NodeState {
        self.inner.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> E::Receiver {
        self.inner.event_bus.subscribe()
    }

    /// Peers this node gossips with.
    pub fn peers(&self) -> Arc<PeerSet> {
        Arc::clone(&self.inner.peers.read())
    }

    /// Round-scoped peer sets known to the hashgraph.
    pub fn peer_sets(&self) -> Vec<(i64, Arc<PeerSet>)> {
        let core = self.inner.core.lock();
        core.hashgraph()
            .peer_sets()
            .iter()
            .map(|(round, peers)| (*round, Arc::clone(peers)))
            .collect()
    }

    pub fn consensus_events(&self) -> Vec<EventHash> {
        self.inner.core.lock().hashgraph().consensus_events().to_vec()
    }

    pub fn last_committed_block(&self) -> i64 {
        self.inner.last_committed_block.load(Ordering::SeqCst)
    }

    /// Queue a transaction directly, bypassing the application's channel.
    pub fn submit_transaction(&self, tx: Vec<u8>) {
        self.inner.core.lock().add_transactions(vec![tx]);
    }

    pub fn stats(&self) -> NodeStats {
        let core = self.inner.core.lock();
        let hg = core.hashgraph();
        NodeStats {
            state: self.state(),
            last_round: hg.max_round(),
            last_consensus_round: hg.last_consensus_round(),
            last_committed_block: self.last_committed_block(),
            total_events: hg.event_count(),
            undetermined_events: hg.undetermined_events().len(),
            consensus_events: hg.consensus_events().len(),
            transaction_pool: core.transaction_pool_len(),
            peers: self.inner.peers.read().len(),
            sync_requests: self.inner.counters.requests(),
            sync_errors: self.inner.counters.errors(),
        }
    }

    /// Drive the node until it shuts down. Returns the error that stopped it,
    /// if any.
    pub async fn run(&self) -> Result<(), ConsensusError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ConsensusError::InvalidState(self.state()));
        }

        let rpcs = self.inner.transport.listen().await?;
        let server = self.clone();
        tokio::spawn(async move { server.serve_rpcs(rpcs).await });
        self.spawn_submission_forwarder();

        let result = self.control_loop().await;
        if let Err(err) = &result {
            error!(node = self.id(), error = %err, "Node stopped");
        }
        self.shutdown().await;

        if let Some(fatal) = self.inner.fatal.lock().take() {
            return Err(fatal);
        }
        result
    }

    async fn control_loop(&self) -> Result<(), ConsensusError> {
        loop {
            match self.state() {
                NodeState::Joining => self.join().await?,
                NodeState::CatchingUp => self.catch_up().await?,
                NodeState::Babbling | NodeState::Leaving => self.babble().await?,
                NodeState::Shutdown => return Ok(()),
            }
        }
    }

    fn spawn_submission_forwarder(&self) {
        let Some(mut submissions) = self.inner.proxy.submit_channel() else {
            return;
        };
        let node = self.clone();
        tokio::spawn(async move {
            let mut shutdown = node.inner.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    tx = submissions.recv() => match tx {
                        Some(tx) => node.submit_transaction(tx),
                        None => break,
                    },
                }
            }
        });
    }

    pub(crate) fn transition(&self, to: NodeState) -> Result<(), ConsensusError> {
        let from = self.inner.state.transition(to)?;
        info!(node = self.id(), %from, %to, "State changed");
        self.publish(NodeEvent::StateChanged { from, to });
        Ok(())
    }

    pub(crate) fn publish(&self, event: NodeEvent) {
        self.inner.event_bus.publish(self.inner.id, event);
    }

    fn is_shut_down(&self) -> bool {
        self.state() == NodeState::Shutdown
    }

    /// Sleep for `duration`. Returns `true` if the node shut down meanwhile.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown.changed() => true,
        }
    }

    fn random_peer(&self) -> Option<Peer> {
        let peers = self.peers();
        let candidates: Vec<&Peer> = peers
            .peers()
            .iter()
            .filter(|peer| peer.pub_key != self.inner.pub_key)
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|peer| (*peer).clone())
    }

    fn set_peers(&self, peers: Arc<PeerSet>) {
        *self.inner.peers.write() = peers;
    }

    /// Follow the hashgraph's peer sets once babbling.
    fn refresh_peers(&self) {
        let peers = self.inner.core.lock().hashgraph().gossip_peer_set();
        if peers.hash() != self.inner.peers.read().hash() {
            self.set_peers(peers);
        }
    }

    /// Ask random known peers to admit us until one answers definitively.
    async fn join(&self) -> Result<(), ConsensusError> {
        let tx = {
            let core = self.inner.core.lock();
            InternalTransaction::join(self.local_peer(), core.signer())?
        };
        let deadline = Instant::now() + self.inner.config.join_timeout;
        info!(node = self.id(), "Requesting to join");

        loop {
            if self.is_shut_down() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConsensusError::JoinTimeout);
            }
            let peer = self.random_peer().ok_or(ConsensusError::NoPeers)?;
            let request = JoinRequest {
                internal_transaction: Some(tx.clone()),
            };

            match tokio::time::timeout(
                deadline - now,
                self.inner.transport.join(&peer.net_addr, request),
            )
            .await
            {
                Err(_) => return Err(ConsensusError::JoinTimeout),
                Ok(Ok(resp)) if resp.accepted => {
                    info!(
                        node = self.id(),
                        accepted_round = resp.accepted_round,
                        peers = resp.peers.len(),
                        "Join accepted"
                    );
                    self.set_peers(Arc::new(PeerSet::new(resp.peers)));
                    return self.transition(NodeState::CatchingUp);
                }
                Ok(Ok(resp)) if resp.retry_later => {
                    debug!(node = self.id(), peer = %peer.moniker, reason = %resp.reason, "Join deferred");
                }
                Ok(Ok(resp)) => return Err(ConsensusError::JoinRejected(resp.reason)),
                Ok(Err(err)) => {
                    debug!(node = self.id(), peer = %peer.moniker, error = %err, "Join request failed");
                }
            }

            if self.sleep_or_shutdown(self.inner.config.heartbeat).await {
                return Ok(());
            }
        }
    }

    /// Fast-forward from random peers, backing off between failures.
    async fn catch_up(&self) -> Result<(), ConsensusError> {
        let mut attempts: u32 = 0;
        let mut backoff = self.inner.config.fast_forward_backoff;
        loop {
            if self.is_shut_down() {
                return Ok(());
            }
            match self.fast_forward().await {
                Ok(()) => return self.transition(NodeState::Babbling),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    attempts += 1;
                    warn!(node = self.id(), attempts, error = %err, "Fast-forward failed");
                    if attempts % self.inner.config.fast_forward_attempts == 0 {
                        error!(node = self.id(), attempts, "Unable to catch up");
                        self.publish(NodeEvent::CatchUpFailed {
                            attempts,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            if self.sleep_or_shutdown(backoff).await {
                return Ok(());
            }
            backoff = (backoff * 2).min(MAX_FAST_FORWARD_BACKOFF);
        }
    }

    async fn fast_forward(&self) -> Result<(), ConsensusError> {
        let peer = self.random_peer().ok_or(ConsensusError::NoPeers)?;
        let resp = self
            .inner
            .transport
            .fast_forward(&peer.net_addr, FastForwardRequest { from_id: self.id() })
            .await?;
        let frame = resp
            .frame
            .ok_or_else(|| ConsensusError::InvalidFrame("missing frame".to_string()))?;
        let hg = Hashgraph::from_frame(&frame, &resp.signature, &self.inner.pub_key)?;

        self.inner.proxy.restore(&resp.snapshot).await?;
        self.inner.store.set_frame(frame.clone()).await?;
        for (round, peers) in hg.peer_sets() {
            self.inner
                .store
                .set_peer_set(*round, peers.as_ref().clone())
                .await?;
        }

        let latest = hg.latest_peer_set();
        self.inner.core.lock().fast_forward(hg);
        self.inner
            .last_committed_block
            .store(frame.last_block_index, Ordering::SeqCst);
        self.set_peers(latest);
        info!(
            node = self.id(),
            from = %peer.moniker,
            round = frame.round,
            events = frame.events.len(),
            last_block = frame.last_block_index,
            "Fast-forwarded"
        );
        Ok(())
    }

    async fn babble(&self) -> Result<(), ConsensusError> {
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => {}
            }
            if !self.state().is_gossiping() {
                return Ok(());
            }
            self.heartbeat().await;
        }
    }

    async fn heartbeat(&self) {
        match self.random_peer() {
            Some(peer) => {
                if let Ok(permit) = Arc::clone(&self.inner.gossip_permits).try_acquire_owned() {
                    let node = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        node.gossip(peer).await;
                    });
                }
            }
            None => {
                if let Err(err) = self.advance_alone().await {
                    self.handle_error(err).await;
                }
            }
        }
        self.commit_pending_blocks().await;
        self.refresh_peers();
    }

    /// A lone member has nobody to sync with and decides on its own events.
    async fn advance_alone(&self) -> Result<(), ConsensusError> {
        let outcome = {
            let mut core = self.inner.core.lock();
            if core.is_busy() {
                core.add_self_event(None).and_then(|_| core.run_consensus())
            } else {
                Ok(0)
            }
        };
        self.persist().await?;
        outcome.map(|_| ())
    }

    async fn gossip(&self, peer: Peer) {
        self.inner.counters.record_request();
        if let Err(err) = self.pull_and_push(&peer).await {
            if !err.is_fatal() {
                self.inner.counters.record_error();
            }
            if err.is_network() {
                debug!(node = self.id(), peer = %peer.moniker, error = %err, "Gossip failed");
                return;
            }
            self.handle_error(err).await;
        }
        self.commit_pending_blocks().await;
    }

    async fn pull_and_push(&self, peer: &Peer) -> Result<(), ConsensusError> {
        let limit = self.inner.config.sync_limit;
        let known = self.inner.core.lock().known_events();
        let resp = self
            .inner
            .transport
            .sync(
                &peer.net_addr,
                SyncRequest {
                    from_id: self.id(),
                    known,
                    sync_limit: limit as u32,
                },
            )
            .await?;

        let outcome = {
            let mut core = self.inner.core.lock();
            core.sync(resp.events)
                .and_then(|_| core.run_consensus())
                .map(|_| core.event_diff(&resp.known, limit))
        };
        self.persist().await?;
        let missing = outcome?;

        if !missing.is_empty() {
            let pushed = missing.len();
            let resp = self
                .inner
                .transport
                .eager_sync(
                    &peer.net_addr,
                    EagerSyncRequest {
                        from_id: self.id(),
                        events: missing,
                    },
                )
                .await?;
            if !resp.success {
                debug!(node = self.id(), peer = %peer.moniker, pushed, "Peer refused pushed events");
            }
        }
        Ok(())
    }

    /// Write newly inserted events and consensus progress to the store.
    pub(crate) async fn persist(&self) -> Result<(), ConsensusError> {
        let (events, last_round) = {
            let mut core = self.inner.core.lock();
            (
                core.take_unpersisted(),
                core.hashgraph().last_consensus_round(),
            )
        };
        for event in events {
            self.inner.store.set_event(event).await?;
        }
        if let Some(round) = last_round {
            self.inner.store.set_last_consensus_round(round).await?;
        }
        Ok(())
    }

    /// Log, report and, for fatal errors, stop the node.
    pub(crate) async fn handle_error(&self, err: ConsensusError) {
        match err {
            ConsensusError::Equivocation {
                ref creator, event, ..
            } => {
                warn!(node = self.id(), %creator, %event, "Equivocation detected");
                self.publish(NodeEvent::EquivocationDetected {
                    creator: creator.clone(),
                    event,
                });
            }
            err if err.is_fatal() => self.fail(err).await,
            err if err.is_validation() => {
                warn!(node = self.id(), error = %err, "Rejected invalid event");
            }
            err => debug!(node = self.id(), error = %err, "Gossip round abandoned"),
        }
    }

    pub(crate) async fn fail(&self, err: ConsensusError) {
        if self.is_shut_down() {
            return;
        }
        error!(node = self.id(), error = %err, "Fatal error, shutting down");
        {
            let mut fatal = self.inner.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.shutdown().await;
    }

    /// Hand decided blocks to the application, in order and exactly once.
    pub(crate) async fn commit_pending_blocks(&self) {
        let _guard = self.inner.commit_lock.lock().await;
        loop {
            let Some(block) = self.inner.core.lock().next_pending_block().cloned() else {
                break;
            };
            if block.index <= self.last_committed_block() {
                self.inner.core.lock().pop_pending_block();
                continue;
            }

            match self.inner.proxy.commit_block(block.clone()).await {
                Ok(resp) => {
                    if let Err(err) = self.inner.store.set_block(block.clone()).await {
                        self.fail(err).await;
                        break;
                    }
                    self.inner.core.lock().pop_pending_block();
                    self.inner
                        .last_committed_block
                        .store(block.index, Ordering::SeqCst);
                    info!(
                        node = self.id(),
                        index = block.index,
                        round = block.round_received,
                        transactions = block.transactions.len(),
                        "Committed block"
                    );
                    self.publish(NodeEvent::BlockCommitted {
                        index: block.index,
                        round_received: block.round_received,
                        transactions: block.transactions.len(),
                        state_hash: resp.state_hash,
                    });
                    self.on_block_committed(&block).await;
                }
                Err(err) => {
                    warn!(node = self.id(), index = block.index, error = %err, "Commit failed, will retry");
                    self.publish(NodeEvent::CommitFailed {
                        index: block.index,
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
    }

    /// Resolve membership requests settled by `block` and adopt the new peers.
    async fn on_block_committed(&self, block: &Block) {
        let mut effective_round = None;
        let mut left_unattended = false;
        for receipt in &block.receipts {
            let waiters = self
                .inner
                .membership_waiters
                .lock()
                .remove(&receipt.transaction.hash());
            let attended = waiters.is_some();
            for waiter in waiters.into_iter().flatten() {
                let _ = waiter.send(receipt.clone());
            }

            if receipt.accepted {
                effective_round = receipt.effective_round;
                let own_leave = receipt.transaction.transaction_type()
                    == Some(TransactionType::Leave)
                    && receipt
                        .transaction
                        .peer()
                        .is_some_and(|peer| peer.pub_key == self.inner.pub_key);
                left_unattended |= own_leave && !attended;
            }
        }

        let Some(effective_round) = effective_round else {
            return;
        };
        let (latest, peer_sets) = {
            let core = self.inner.core.lock();
            (core.latest_peer_set(), core.hashgraph().peer_sets().clone())
        };
        for (round, peers) in peer_sets {
            if let Err(err) = self
                .inner
                .store
                .set_peer_set(round, peers.as_ref().clone())
                .await
            {
                self.fail(err).await;
                return;
            }
        }
        info!(
            node = self.id(),
            effective_round,
            peers = latest.len(),
            "Peer set changed"
        );
        self.publish(NodeEvent::PeerSetChanged {
            effective_round,
            peers: latest.len(),
        });
        self.refresh_peers();

        if left_unattended {
            info!(node = self.id(), "Own leave committed after the request gave up");
            let node = self.clone();
            let deadline = Instant::now() + self.inner.config.join_timeout;
            tokio::spawn(async move { node.retire(effective_round, deadline).await });
        }
    }

    pub(crate) fn register_waiter(
        &self,
        tx_hash: [u8; 32],
    ) -> oneshot::Receiver<InternalTransactionReceipt> {
        let (sender, receiver) = oneshot::channel();
        self.inner
            .membership_waiters
            .lock()
            .entry(tx_hash)
            .or_default()
            .push(sender);
        receiver
    }

    /// Leave the network. Returns once the departure is committed and the
    /// peer set without us is in effect, after which the node is shut down.
    pub async fn leave(&self) -> Result<(), ConsensusError> {
        let state = self.state();
        if state != NodeState::Babbling {
            return Err(ConsensusError::InvalidState(state));
        }

        let (latest, tx) = {
            let core = self.inner.core.lock();
            (
                core.latest_peer_set(),
                InternalTransaction::leave(self.local_peer(), core.signer())?,
            )
        };
        if !latest.contains(&self.inner.pub_key) {
            return Err(ConsensusError::LeaveRejected("not a member".to_string()));
        }
        if latest.len() == 1 {
            info!(node = self.id(), "Last member leaving");
            self.shutdown().await;
            return Ok(());
        }

        self.transition(NodeState::Leaving)?;
        let tx_hash = tx.hash();
        let outcome = self.register_waiter(tx_hash);
        let queued = self.inner.core.lock().add_internal_transaction(tx);
        if let Err(err) = queued {
            self.inner.membership_waiters.lock().remove(&tx_hash);
            let _ = self.transition(NodeState::Babbling);
            return Err(err);
        }
        info!(node = self.id(), "Leave requested");

        match tokio::time::timeout(self.inner.config.join_timeout, outcome).await {
            Ok(Ok(receipt)) if receipt.accepted => {
                let effective_round = receipt.effective_round.unwrap_or_default();
                info!(node = self.id(), effective_round, "Leave committed");
                self.retire(effective_round, Instant::now() + self.inner.config.join_timeout)
                    .await;
                Ok(())
            }
            Ok(Ok(_)) => {
                let _ = self.transition(NodeState::Babbling);
                Err(ConsensusError::LeaveRejected(
                    "rejected by consensus".to_string(),
                ))
            }
            Ok(Err(_)) => Err(ConsensusError::InvalidState(self.state())),
            Err(_) => {
                self.inner.membership_waiters.lock().remove(&tx_hash);
                let _ = self.transition(NodeState::Babbling);
                Err(ConsensusError::LeaveTimeout)
            }
        }
    }

    /// Keep gossiping until `effective_round` is decided: up to then our
    /// witnesses count towards the old quorum. Then shut down.
    async fn retire(&self, effective_round: i64, deadline: Instant) {
        loop {
            let decided = self
                .inner
                .core
                .lock()
                .hashgraph()
                .last_consensus_round()
                .is_some_and(|round| round >= effective_round);
            if decided {
                break;
            }
            if Instant::now() >= deadline {
                warn!(node = self.id(), effective_round, "Leaving before the new peer set took effect");
                break;
            }
            if self.sleep_or_shutdown(self.inner.config.heartbeat).await {
                return;
            }
        }
        info!(node = self.id(), effective_round, "Left the network");
        self.shutdown().await;
    }

    /// Stop every task, close the transport and the store. Idempotent.
    pub async fn shutdown(&self) {
        let Some(previous) = self.inner.state.shutdown() else {
            return;
        };
        info!(node = self.id(), from = %previous, "Shutting down");
        self.publish(NodeEvent::StateChanged {
            from: previous,
            to: NodeState::Shutdown,
        });
        self.inner.shutdown_tx.send_replace(true);
        self.inner.membership_waiters.lock().clear();

        if let Err(err) = self.inner.transport.close().await {
            warn!(node = self.id(), error = %err, "Failed to close transport");
        }
        if let Err(err) = self.inner.store.close().await {
            warn!(node = self.id(), error = %err, "Failed to close store");
        }
    }
}

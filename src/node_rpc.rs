use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    block::{InternalTransactionReceipt, sign_frame},
    error::ConsensusError,
    events::NodeEventBus,
    node::Node,
    protos::hashgraph::v1::{
        EagerSyncRequest, EagerSyncResponse, FastForwardRequest, FastForwardResponse,
        JoinRequest, JoinResponse, SyncRequest, SyncResponse, TransactionType,
    },
    proxy::AppProxy,
    state::NodeState,
    store::Store,
    transport::{Rpc, RpcRequest, RpcResponse, Transport},
};

impl<S, T, P, E> Node<S, T, P, E>
where
    S: Store,
    T: Transport,
    P: AppProxy,
    E: NodeEventBus,
{
    /// Answer inbound requests until shutdown, one task per request.
    pub(crate) async fn serve_rpcs(&self, mut rpcs: mpsc::Receiver<Rpc>) {
        let mut shutdown = self.subscribe_state();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() == NodeState::Shutdown {
                        break;
                    }
                }
                rpc = rpcs.recv() => {
                    let Some(rpc) = rpc else {
                        break;
                    };
                    let node = self.clone();
                    tokio::spawn(async move { node.handle_rpc(rpc).await });
                }
            }
        }
        debug!(node = self.id(), "RPC server stopped");
    }

    async fn handle_rpc(&self, rpc: Rpc) {
        let Rpc { request, responder } = rpc;
        let response = match request {
            RpcRequest::Sync(req) => self.handle_sync(req).map(RpcResponse::Sync),
            RpcRequest::EagerSync(req) => self
                .handle_eager_sync(req)
                .await
                .map(RpcResponse::EagerSync),
            RpcRequest::FastForward(req) => self
                .handle_fast_forward(req)
                .await
                .map(RpcResponse::FastForward),
            RpcRequest::Join(req) => self.handle_join(req).await.map(RpcResponse::Join),
        };
        let _ = responder.send(response);
    }

    fn ensure_gossiping(&self) -> Result<(), ConsensusError> {
        let state = self.state();
        if state.is_gossiping() {
            Ok(())
        } else {
            Err(ConsensusError::InvalidState(state))
        }
    }

    /// Return the events the requester lacks, and what we know.
    pub(crate) fn handle_sync(&self, req: SyncRequest) -> Result<SyncResponse, ConsensusError> {
        self.ensure_gossiping()?;
        let limit = match req.sync_limit as usize {
            0 => self.inner.config.sync_limit,
            requested => requested.min(self.inner.config.sync_limit),
        };
        let core = self.inner.core.lock();
        Ok(SyncResponse {
            from_id: self.id(),
            events: core.event_diff(&req.known, limit),
            known: core.known_events(),
        })
    }

    /// Insert events pushed by a peer that pulled from us.
    pub(crate) async fn handle_eager_sync(
        &self,
        req: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, ConsensusError> {
        self.ensure_gossiping()?;
        let outcome = {
            let mut core = self.inner.core.lock();
            core.insert_batch(req.events)
                .and_then(|_| core.run_consensus())
        };
        if let Err(err) = self.persist().await {
            let reason = err.to_string();
            self.fail(err).await;
            return Err(ConsensusError::Store(reason));
        }

        let success = match outcome {
            Ok(_) => true,
            Err(err) => {
                debug!(node = self.id(), from = req.from_id, "Pushed batch rejected");
                self.handle_error(err).await;
                false
            }
        };
        self.commit_pending_blocks().await;
        Ok(EagerSyncResponse {
            from_id: self.id(),
            success,
        })
    }

    /// Cut a frame at our last decided round, with the matching application
    /// snapshot.
    pub(crate) async fn handle_fast_forward(
        &self,
        req: FastForwardRequest,
    ) -> Result<FastForwardResponse, ConsensusError> {
        self.ensure_gossiping()?;
        let (frame, signature) = {
            let core = self.inner.core.lock();
            let frame = core.build_frame()?;
            let signature = sign_frame(&frame, core.signer())?;
            (frame, signature)
        };
        let snapshot = self.inner.proxy.get_snapshot(frame.last_block_index).await?;
        info!(
            node = self.id(),
            to = req.from_id,
            round = frame.round,
            events = frame.events.len(),
            "Serving fast-forward"
        );
        Ok(FastForwardResponse {
            from_id: self.id(),
            frame: Some(frame),
            snapshot,
            signature,
        })
    }

    /// Queue a join request and answer once consensus has settled it.
    pub(crate) async fn handle_join(&self, req: JoinRequest) -> Result<JoinResponse, ConsensusError> {
        let state = self.state();
        if state != NodeState::Babbling {
            return Ok(self.join_response(false, true, format!("peer is {state}")));
        }
        let Some(tx) = req.internal_transaction else {
            return Ok(self.join_response(false, false, "missing transaction".to_string()));
        };
        if tx.transaction_type() != Some(TransactionType::Join) || !tx.verify().unwrap_or(false) {
            warn!(node = self.id(), "Invalid join request");
            return Ok(self.join_response(false, false, "invalid join request".to_string()));
        }

        let tx_hash = tx.hash();
        let outcome = {
            let mut waiters = self.inner.membership_waiters.lock();
            let (sender, receiver) = oneshot::channel::<InternalTransactionReceipt>();
            if let Some(pending) = waiters.get_mut(&tx_hash) {
                pending.push(sender);
            } else {
                match self.inner.core.lock().add_internal_transaction(tx) {
                    Ok(()) => {
                        waiters.insert(tx_hash, vec![sender]);
                    }
                    Err(ConsensusError::MembershipChangeInProgress) => {
                        return Ok(self.join_response(
                            false,
                            true,
                            "membership change in progress".to_string(),
                        ));
                    }
                    Err(err) => return Err(err),
                }
            }
            receiver
        };
        info!(node = self.id(), "Join request queued");

        match tokio::time::timeout(self.inner.config.join_timeout, outcome).await {
            Ok(Ok(receipt)) => {
                let peers = self.inner.core.lock().latest_peer_set();
                Ok(JoinResponse {
                    from_id: self.id(),
                    accepted: receipt.accepted,
                    accepted_round: receipt.effective_round.unwrap_or(-1),
                    peers: peers.peers().to_vec(),
                    reason: if receipt.accepted {
                        String::new()
                    } else {
                        "rejected by consensus".to_string()
                    },
                    retry_later: false,
                })
            }
            Ok(Err(_)) => Ok(self.join_response(false, true, "peer shut down".to_string())),
            Err(_) => Ok(self.join_response(
                false,
                true,
                "timed out waiting for commit".to_string(),
            )),
        }
    }

    fn join_response(&self, accepted: bool, retry_later: bool, reason: String) -> JoinResponse {
        JoinResponse {
            from_id: self.id(),
            accepted,
            accepted_round: -1,
            peers: Vec::new(),
            reason,
            retry_later,
        }
    }
}

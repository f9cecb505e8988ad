//! Request/response transport between nodes.
//!
//! A node receives inbound requests as [`Rpc`]s from [`Transport::listen`]
//! and answers each through its responder. [`InmemNetwork`] routes requests
//! between transports living in the same process and can cut an address off
//! to simulate a partition.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::ConsensusError,
    protos::hashgraph::v1::{
        EagerSyncRequest, EagerSyncResponse, FastForwardRequest, FastForwardResponse,
        JoinRequest, JoinResponse, SyncRequest, SyncResponse,
    },
};

#[derive(Debug, Clone)]
pub enum RpcRequest {
    Sync(SyncRequest),
    EagerSync(EagerSyncRequest),
    FastForward(FastForwardRequest),
    Join(JoinRequest),
}

#[derive(Debug, Clone)]
pub enum RpcResponse {
    Sync(SyncResponse),
    EagerSync(EagerSyncResponse),
    FastForward(FastForwardResponse),
    Join(JoinResponse),
}

/// An inbound request and the channel to answer it on.
#[derive(Debug)]
pub struct Rpc {
    pub request: RpcRequest,
    pub responder: oneshot::Sender<Result<RpcResponse, ConsensusError>>,
}

impl Rpc {
    pub fn respond(self, response: Result<RpcResponse, ConsensusError>) {
        let _ = self.responder.send(response);
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> &str;

    /// Hand over the inbound request stream. Can be taken once.
    async fn listen(&self) -> Result<mpsc::Receiver<Rpc>, ConsensusError>;

    async fn sync(&self, target: &str, req: SyncRequest) -> Result<SyncResponse, ConsensusError>;

    async fn eager_sync(
        &self,
        target: &str,
        req: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, ConsensusError>;

    async fn fast_forward(
        &self,
        target: &str,
        req: FastForwardRequest,
    ) -> Result<FastForwardResponse, ConsensusError>;

    async fn join(&self, target: &str, req: JoinRequest) -> Result<JoinResponse, ConsensusError>;

    async fn close(&self) -> Result<(), ConsensusError>;
}

#[derive(Default)]
struct NetworkInner {
    routes: RwLock<HashMap<String, mpsc::Sender<Rpc>>>,
    partitioned: RwLock<HashSet<String>>,
}

/// In-process registry of transports.
#[derive(Clone, Default)]
pub struct InmemNetwork {
    inner: Arc<NetworkInner>,
}

impl InmemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport listening on `addr`.
    pub fn transport(
        &self,
        addr: impl Into<String>,
        timeout: Duration,
        join_timeout: Duration,
    ) -> InmemTransport {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(1024);
        self.inner.routes.write().insert(addr.clone(), tx);
        InmemTransport {
            addr,
            network: self.clone(),
            inbound: Mutex::new(Some(rx)),
            timeout,
            join_timeout,
        }
    }

    /// Cut `addr` off: requests from or to it fail until healed.
    pub fn partition(&self, addr: &str) {
        self.inner.partitioned.write().insert(addr.to_string());
    }

    pub fn heal(&self, addr: &str) {
        self.inner.partitioned.write().remove(addr);
    }

    fn is_partitioned(&self, addr: &str) -> bool {
        self.inner.partitioned.read().contains(addr)
    }

    fn route(&self, addr: &str) -> Option<mpsc::Sender<Rpc>> {
        self.inner.routes.read().get(addr).cloned()
    }

    fn unregister(&self, addr: &str) {
        self.inner.routes.write().remove(addr);
    }
}

pub struct InmemTransport {
    addr: String,
    network: InmemNetwork,
    inbound: Mutex<Option<mpsc::Receiver<Rpc>>>,
    timeout: Duration,
    join_timeout: Duration,
}

impl InmemTransport {
    async fn request(
        &self,
        target: &str,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, ConsensusError> {
        if self.network.is_partitioned(&self.addr) || self.network.is_partitioned(target) {
            return Err(ConsensusError::PeerUnreachable(target.to_string()));
        }
        let route = self
            .network
            .route(target)
            .ok_or_else(|| ConsensusError::PeerUnreachable(target.to_string()))?;

        let (responder, response) = oneshot::channel();
        route
            .send(Rpc { request, responder })
            .await
            .map_err(|_| ConsensusError::PeerUnreachable(target.to_string()))?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsensusError::Transport(format!(
                "{target} dropped the request"
            ))),
            Err(_) => Err(ConsensusError::Timeout(target.to_string())),
        }
    }
}

fn unexpected(target: &str) -> ConsensusError {
    ConsensusError::Transport(format!("unexpected response type from {target}"))
}

#[async_trait::async_trait]
impl Transport for InmemTransport {
    fn local_addr(&self) -> &str {
        &self.addr
    }

    async fn listen(&self) -> Result<mpsc::Receiver<Rpc>, ConsensusError> {
        self.inbound
            .lock()
            .take()
            .ok_or_else(|| ConsensusError::Transport(format!("{} already listening", self.addr)))
    }

    async fn sync(&self, target: &str, req: SyncRequest) -> Result<SyncResponse, ConsensusError> {
        match self
            .request(target, RpcRequest::Sync(req), self.timeout)
            .await?
        {
            RpcResponse::Sync(resp) => Ok(resp),
            _ => Err(unexpected(target)),
        }
    }

    async fn eager_sync(
        &self,
        target: &str,
        req: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, ConsensusError> {
        match self
            .request(target, RpcRequest::EagerSync(req), self.timeout)
            .await?
        {
            RpcResponse::EagerSync(resp) => Ok(resp),
            _ => Err(unexpected(target)),
        }
    }

    async fn fast_forward(
        &self,
        target: &str,
        req: FastForwardRequest,
    ) -> Result<FastForwardResponse, ConsensusError> {
        match self
            .request(target, RpcRequest::FastForward(req), self.timeout)
            .await?
        {
            RpcResponse::FastForward(resp) => Ok(resp),
            _ => Err(unexpected(target)),
        }
    }

    async fn join(&self, target: &str, req: JoinRequest) -> Result<JoinResponse, ConsensusError> {
        match self
            .request(target, RpcRequest::Join(req), self.join_timeout)
            .await?
        {
            RpcResponse::Join(resp) => Ok(resp),
            _ => Err(unexpected(target)),
        }
    }

    async fn close(&self) -> Result<(), ConsensusError> {
        self.network.unregister(&self.addr);
        Ok(())
    }
}

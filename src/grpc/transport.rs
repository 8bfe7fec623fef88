use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::proto::{self, raft_service_client::RaftServiceClient};
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::transport::Transport;

/// Outbound RPCs over tonic. Channels are created lazily on first use and
/// reconnect on their own; every call is bounded by the configured timeout.
pub struct GrpcTransport {
    addrs: HashMap<u64, String>,
    clients: Mutex<HashMap<u64, RaftServiceClient<Channel>>>,
    disconnected: RwLock<HashSet<u64>>,
    rpc_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            addrs: config
                .peers
                .iter()
                .map(|p| (p.node_id, p.addr.clone()))
                .collect(),
            clients: Mutex::new(HashMap::new()),
            disconnected: RwLock::new(HashSet::new()),
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
        }
    }

    /// Drop all traffic to `peer_id` until `reconnect_peer` is called.
    pub async fn disconnect_peer(&self, peer_id: u64) {
        tracing::info!(peer_id, "Disconnecting peer");
        self.disconnected.write().await.insert(peer_id);
        self.clients.lock().await.remove(&peer_id);
    }

    pub async fn reconnect_peer(&self, peer_id: u64) {
        tracing::info!(peer_id, "Reconnecting peer");
        self.disconnected.write().await.remove(&peer_id);
    }

    async fn client(&self, peer_id: u64) -> Result<RaftServiceClient<Channel>> {
        if self.disconnected.read().await.contains(&peer_id) {
            return Err(RaftError::Transport(format!("peer {} is disconnected", peer_id)));
        }

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&peer_id) {
            return Ok(client.clone());
        }

        let addr = self
            .addrs
            .get(&peer_id)
            .ok_or_else(|| RaftError::InvalidArgument(format!("unknown peer {}", peer_id)))?;
        let channel = Endpoint::from_shared(format!("http://{}", addr))?
            .connect_timeout(self.rpc_timeout)
            .timeout(self.rpc_timeout)
            .connect_lazy();
        let client = RaftServiceClient::new(channel);
        clients.insert(peer_id, client.clone());
        Ok(client)
    }

    async fn call<T, F>(&self, peer_id: u64, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(RaftError::Grpc(status)),
            Err(_) => Err(RaftError::Transport(format!(
                "RPC to peer {} timed out",
                peer_id
            ))),
        }
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn request_vote(&self, target: u64, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let mut client = self.client(target).await?;
        let req = proto::VoteRequest::from(args);
        let resp = self.call(target, client.request_vote(req)).await?;
        Ok(resp.into())
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let mut client = self.client(target).await?;
        let req = proto::AppendEntriesRequest::from(args);
        let resp = self.call(target, client.append_entries(req)).await?;
        Ok(resp.into())
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply> {
        let mut client = self.client(target).await?;
        let req = proto::InstallSnapshotRequest::from(args);
        let resp = self.call(target, client.install_snapshot(req)).await?;
        Ok(resp.into())
    }
}

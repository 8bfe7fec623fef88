use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterService;
use crate::proto::client_service_server::ClientServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftNode;

pub struct GrpcServer {
    addr: SocketAddr,
    raft_node: Arc<RaftNode>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, raft_node: Arc<RaftNode>) -> Self {
        Self { addr, raft_node }
    }

    fn router(&self) -> tonic::transport::server::Router {
        let cluster_service = ClusterService::new(self.raft_node.clone());
        let client_service = ClientService::new(self.raft_node.clone());

        Server::builder()
            .add_service(RaftServiceServer::new(cluster_service))
            .add_service(ClientServiceServer::new(client_service))
    }

    /// Serve on the configured address until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        self.router()
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }

    /// Serve on an already bound listener, e.g. one bound to port 0.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = ?listener.local_addr().ok(), "Starting gRPC server");

        self.router()
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
    }
}

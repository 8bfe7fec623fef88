use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::proto::client_service_server::ClientService as ClientRpc;
use crate::proto::{GetStateRequest, GetStateResponse, SubmitRequest, SubmitResponse};
use crate::raft::RaftNode;

/// Application-facing gRPC API: submit commands and inspect the peer.
pub struct ClientService {
    raft_node: Arc<RaftNode>,
}

impl ClientService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

#[tonic::async_trait]
impl ClientRpc for ClientService {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let req = request.into_inner();
        if req.command.is_empty() {
            return Err(Status::invalid_argument("Command cannot be empty"));
        }

        match self.raft_node.start(req.command).await {
            Ok((index, term)) => {
                tracing::info!(index, term, "Command submitted");
                Ok(Response::new(SubmitResponse {
                    is_leader: true,
                    index,
                    term,
                    leader_id: Some(self.raft_node.id),
                }))
            }
            Err(RaftError::NotLeader(leader_id)) => {
                let (term, _) = self.raft_node.get_state().await;
                Ok(Response::new(SubmitResponse {
                    is_leader: false,
                    index: 0,
                    term,
                    leader_id,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_state(
        &self,
        _request: Request<GetStateRequest>,
    ) -> Result<Response<GetStateResponse>, Status> {
        let status = self.raft_node.status().await;
        Ok(Response::new(status.into()))
    }
}

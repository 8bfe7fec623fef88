use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::RaftError;
use crate::raft::RaftNode;
use crate::state_machine::{KvCommand, KvStore};

#[derive(Clone)]
pub struct DashboardState {
    pub raft_node: Arc<RaftNode>,
    pub kv: Arc<RwLock<KvStore>>,
}

#[derive(Deserialize)]
struct SubmitCommandRequest {
    command: String,
}

#[derive(Serialize)]
struct SubmitCommandResponse {
    success: bool,
    index: Option<u64>,
    term: Option<u64>,
    leader_id: Option<u64>,
    error: Option<String>,
}

impl SubmitCommandResponse {
    fn failed(error: String, leader_id: Option<u64>) -> Self {
        Self {
            success: false,
            index: None,
            term: None,
            leader_id,
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
struct KvResponse {
    key: String,
    value: Option<String>,
    last_applied: u64,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/commands", post(submit_command_handler))
        .route("/api/kv/:key", get(kv_get_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.raft_node.status().await)
}

async fn submit_command_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitCommandRequest>,
) -> impl IntoResponse {
    let command = match KvCommand::parse(payload.command.as_bytes()) {
        Ok(command) => command,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SubmitCommandResponse::failed(e.to_string(), None)),
            )
        }
    };

    match state.raft_node.start(command.encode()).await {
        Ok((index, term)) => (
            StatusCode::OK,
            Json(SubmitCommandResponse {
                success: true,
                index: Some(index),
                term: Some(term),
                leader_id: Some(state.raft_node.id),
                error: None,
            }),
        ),
        Err(RaftError::NotLeader(leader_id)) => (
            StatusCode::CONFLICT,
            Json(SubmitCommandResponse::failed(
                "Not the leader".to_string(),
                leader_id,
            )),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SubmitCommandResponse::failed(e.to_string(), None)),
        ),
    }
}

async fn kv_get_handler(
    State(state): State<DashboardState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let kv = state.kv.read().await;
    let value = kv.get(&key);
    let status = if value.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        status,
        Json(KvResponse {
            key,
            value,
            last_applied: kv.last_applied(),
        }),
    )
}

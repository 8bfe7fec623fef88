use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use raft_lite::config::{NodeConfig, PeerConfig};
use raft_lite::node::Node;
use raft_lite::proto::client_service_client::ClientServiceClient;
use raft_lite::proto::{GetStateRequest, SubmitRequest};
use raft_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "A Raft consensus peer replicating a key-value store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a raft-lite server node
    Server(ServerArgs),

    /// Submit a command (e.g. "SET key value") to the cluster
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        command: String,
    },

    /// Show the state of one peer
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique, non-zero)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Port for the HTTP status endpoint (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for durable Raft state; in-memory if omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Snapshot the state machine once the persisted Raft state reaches this many bytes
    #[arg(long)]
    max_raft_state: Option<usize>,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SubmitOutput {
    accepted: bool,
    index: u64,
    term: u64,
    leader_id: Option<u64>,
}

#[derive(Serialize)]
struct StatusOutput {
    node_id: u64,
    role: String,
    term: u64,
    leader_id: Option<u64>,
    commit_index: u64,
    last_applied: u64,
    last_log_index: u64,
    snapshot_index: u64,
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let node_id: u64 = parts[0].parse().ok()?;
                let addr = format!("{}:{}", parts[1], parts[2]);
                Some(PeerConfig { node_id, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                None
            }
        })
        .collect()
}

async fn connect(
    args: &ClientArgs,
) -> Result<ClientServiceClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(args.addr.clone())?.connect().await?;
    Ok(ClientServiceClient::new(channel))
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        peers: parse_peers(&args.peers),
        data_dir: args.data_dir,
        max_raft_state_bytes: args.max_raft_state,
        ..NodeConfig::default()
    };

    tracing::info!(
        node_id = config.node_id,
        addr = %config.listen_addr,
        peers = config.peers.len(),
        data_dir = ?config.data_dir,
        "Starting raft-lite node"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config, dashboard_addr)?;
    node.run(shutdown).await?;

    tracing::info!("Node stopped");
    Ok(())
}

async fn handle_submit(
    client: &mut ClientServiceClient<Channel>,
    command: String,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = client
        .submit(SubmitRequest {
            command: command.into_bytes(),
        })
        .await?
        .into_inner();

    match output {
        OutputFormat::Json => {
            let out = SubmitOutput {
                accepted: resp.is_leader,
                index: resp.index,
                term: resp.term,
                leader_id: resp.leader_id,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            if resp.is_leader {
                println!("Command accepted at index {} (term {})", resp.index, resp.term);
            } else {
                match resp.leader_id {
                    Some(leader) => println!("Not the leader; try node {}", leader),
                    None => println!("Not the leader; no leader known"),
                }
            }
        }
    }
    Ok(())
}

async fn handle_status(
    client: &mut ClientServiceClient<Channel>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = client.get_state(GetStateRequest {}).await?.into_inner();

    match output {
        OutputFormat::Json => {
            let out = StatusOutput {
                node_id: resp.node_id,
                role: resp.role,
                term: resp.term,
                leader_id: resp.leader_id,
                commit_index: resp.commit_index,
                last_applied: resp.last_applied,
                last_log_index: resp.last_log_index,
                snapshot_index: resp.snapshot_index,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("{:<16} {}", "Node", resp.node_id);
            println!("{:<16} {}", "Role", resp.role);
            println!("{:<16} {}", "Term", resp.term);
            println!(
                "{:<16} {}",
                "Leader",
                resp.leader_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("{:<16} {}", "Commit index", resp.commit_index);
            println!("{:<16} {}", "Last applied", resp.last_applied);
            println!("{:<16} {}", "Last log index", resp.last_log_index);
            println!("{:<16} {}", "Snapshot index", resp.snapshot_index);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Submit { client, command } => {
            let mut grpc_client = connect(&client).await?;
            handle_submit(&mut grpc_client, command, &client.output).await?;
        }
        Commands::Status { client } => {
            let mut grpc_client = connect(&client).await?;
            handle_status(&mut grpc_client, &client.output).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peers_accepts_id_host_port_list() {
        let peers = parse_peers("2:127.0.0.1:50052, 3:node3:50053");
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, 2);
        assert_eq!(peers[0].addr, "127.0.0.1:50052");
        assert_eq!(peers[1].addr, "node3:50053");
    }

    #[test]
    fn parse_peers_skips_malformed_entries() {
        assert!(parse_peers("").is_empty());
        let peers = parse_peers("x:host:1,2:host,3:h:3");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, 3);
    }
}

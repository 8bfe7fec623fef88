use crate::error::Result;
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

/// Outbound RPC path to the other peers.
///
/// An `Err` means the call got no answer (peer down, partitioned, timed out);
/// the caller treats it as a lost message and retries on a later tick.
#[tonic::async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, target: u64, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply>;

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply>;
}

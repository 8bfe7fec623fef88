//! Conversions between the protobuf wire types and the protocol types.

use crate::proto;
use crate::raft::node::RaftStatus;
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::state::{LogEntry, RaftRole};

impl From<proto::LogEntry> for LogEntry {
    fn from(e: proto::LogEntry) -> Self {
        Self {
            index: e.index,
            term: e.term,
            command: e.command,
        }
    }
}

impl From<LogEntry> for proto::LogEntry {
    fn from(e: LogEntry) -> Self {
        Self {
            index: e.index,
            term: e.term,
            command: e.command,
        }
    }
}

impl From<proto::VoteRequest> for RequestVoteArgs {
    fn from(req: proto::VoteRequest) -> Self {
        Self {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<RequestVoteArgs> for proto::VoteRequest {
    fn from(args: RequestVoteArgs) -> Self {
        Self {
            term: args.term,
            candidate_id: args.candidate_id,
            last_log_index: args.last_log_index,
            last_log_term: args.last_log_term,
        }
    }
}

impl From<proto::VoteResponse> for RequestVoteReply {
    fn from(resp: proto::VoteResponse) -> Self {
        Self {
            term: resp.term,
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<RequestVoteReply> for proto::VoteResponse {
    fn from(reply: RequestVoteReply) -> Self {
        Self {
            term: reply.term,
            vote_granted: reply.vote_granted,
        }
    }
}

impl From<proto::AppendEntriesRequest> for AppendEntriesArgs {
    fn from(req: proto::AppendEntriesRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.into_iter().map(LogEntry::from).collect(),
            leader_commit: req.leader_commit,
        }
    }
}

impl From<AppendEntriesArgs> for proto::AppendEntriesRequest {
    fn from(args: AppendEntriesArgs) -> Self {
        Self {
            term: args.term,
            leader_id: args.leader_id,
            prev_log_index: args.prev_log_index,
            prev_log_term: args.prev_log_term,
            entries: args.entries.into_iter().map(proto::LogEntry::from).collect(),
            leader_commit: args.leader_commit,
        }
    }
}

impl From<proto::AppendEntriesResponse> for AppendEntriesReply {
    fn from(resp: proto::AppendEntriesResponse) -> Self {
        Self {
            term: resp.term,
            success: resp.success,
            conflict_index: resp.conflict_index,
            conflict_term: resp.conflict_term,
        }
    }
}

impl From<AppendEntriesReply> for proto::AppendEntriesResponse {
    fn from(reply: AppendEntriesReply) -> Self {
        Self {
            term: reply.term,
            success: reply.success,
            conflict_index: reply.conflict_index,
            conflict_term: reply.conflict_term,
        }
    }
}

impl From<proto::InstallSnapshotRequest> for InstallSnapshotArgs {
    fn from(req: proto::InstallSnapshotRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id,
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            data: req.data,
        }
    }
}

impl From<InstallSnapshotArgs> for proto::InstallSnapshotRequest {
    fn from(args: InstallSnapshotArgs) -> Self {
        Self {
            term: args.term,
            leader_id: args.leader_id,
            last_included_index: args.last_included_index,
            last_included_term: args.last_included_term,
            data: args.data,
        }
    }
}

impl From<proto::InstallSnapshotResponse> for InstallSnapshotReply {
    fn from(resp: proto::InstallSnapshotResponse) -> Self {
        Self { term: resp.term }
    }
}

impl From<InstallSnapshotReply> for proto::InstallSnapshotResponse {
    fn from(reply: InstallSnapshotReply) -> Self {
        Self { term: reply.term }
    }
}

impl From<RaftStatus> for proto::GetStateResponse {
    fn from(status: RaftStatus) -> Self {
        Self {
            node_id: status.node_id,
            term: status.term,
            is_leader: status.role == RaftRole::Leader,
            role: status.role.to_string(),
            leader_id: status.leader_id,
            commit_index: status.commit_index,
            last_applied: status.last_applied,
            last_log_index: status.last_log_index,
            snapshot_index: status.snapshot_index,
        }
    }
}

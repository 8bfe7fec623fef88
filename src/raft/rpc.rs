use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::state::{LogEntry, RaftRole, RaftState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// On rejection, `conflict_index`/`conflict_term` let the leader skip a whole
/// term of mismatching entries instead of backing up one index per round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_index: u64,
    pub conflict_term: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

impl RequestVoteArgs {
    pub fn validate(&self) -> Result<()> {
        if self.candidate_id == 0 {
            return Err(RaftError::InvalidArgument("candidate id 0".to_string()));
        }
        if self.last_log_term > self.term {
            return Err(RaftError::InvalidArgument(format!(
                "last log term {} is ahead of request term {}",
                self.last_log_term, self.term
            )));
        }
        Ok(())
    }
}

impl AppendEntriesArgs {
    pub fn validate(&self) -> Result<()> {
        if self.leader_id == 0 {
            return Err(RaftError::InvalidArgument("leader id 0".to_string()));
        }
        if self.prev_log_term > self.term {
            return Err(RaftError::InvalidArgument(format!(
                "prev log term {} is ahead of request term {}",
                self.prev_log_term, self.term
            )));
        }
        let mut expected = self.prev_log_index + 1;
        for entry in &self.entries {
            if entry.index != expected {
                return Err(RaftError::InvalidArgument(format!(
                    "entry index {} where {} was expected",
                    entry.index, expected
                )));
            }
            if entry.term > self.term {
                return Err(RaftError::InvalidArgument(format!(
                    "entry {} has term {} beyond request term {}",
                    entry.index, entry.term, self.term
                )));
            }
            expected += 1;
        }
        Ok(())
    }

    /// Index of the last entry carried, or `prev_log_index` for a heartbeat.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

impl InstallSnapshotArgs {
    pub fn validate(&self) -> Result<()> {
        if self.leader_id == 0 {
            return Err(RaftError::InvalidArgument("leader id 0".to_string()));
        }
        if self.last_included_index == 0 {
            return Err(RaftError::InvalidArgument(
                "snapshot must cover at least one entry".to_string(),
            ));
        }
        if self.last_included_term > self.term {
            return Err(RaftError::InvalidArgument(format!(
                "snapshot term {} is ahead of request term {}",
                self.last_included_term, self.term
            )));
        }
        Ok(())
    }
}

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &RequestVoteArgs,
    my_id: u64,
) -> Result<RequestVoteReply> {
    req.validate()?;

    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        if state.voted_for != Some(req.candidate_id) {
            state.voted_for = Some(req.candidate_id);
            state.persist_needs.hard_state = true;
        }
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    Ok(RequestVoteReply {
        term: state.current_term,
        vote_granted,
    })
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesArgs,
    my_id: u64,
) -> Result<AppendEntriesReply> {
    req.validate()?;

    if req.term < state.current_term {
        return Ok(reject(state.current_term, 0, None));
    }

    // Valid leader for this term; a candidate steps down
    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    // A prefix already covered by our snapshot is committed and needs no check
    if req.prev_log_index >= state.snapshot_last_index {
        if req.prev_log_index > state.last_log_index() {
            return Ok(reject(
                state.current_term,
                state.last_log_index() + 1,
                None,
            ));
        }
        if let Some(term) = state.term_at(req.prev_log_index) {
            if term != req.prev_log_term {
                let conflict_index = state
                    .first_index_of_term(term)
                    .unwrap_or(req.prev_log_index);
                tracing::debug!(
                    node_id = my_id,
                    prev_log_index = req.prev_log_index,
                    conflict_term = term,
                    conflict_index,
                    "AppendEntries log mismatch"
                );
                return Ok(reject(state.current_term, conflict_index, Some(term)));
            }
        }
    }

    if !req.entries.is_empty() {
        state.merge_entries(&req.entries);
        tracing::debug!(
            node_id = my_id,
            entries_received = req.entries.len(),
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    let last_new = req.last_index();
    if req.leader_commit > state.commit_index {
        let new_commit = req.leader_commit.min(last_new);
        if new_commit > state.commit_index {
            state.commit_index = new_commit;
        }
    }

    Ok(AppendEntriesReply {
        term: state.current_term,
        success: true,
        conflict_index: 0,
        conflict_term: None,
    })
}

/// Handle InstallSnapshot RPC.
///
/// A snapshot newer than everything committed replaces the matching log
/// prefix and is queued for delivery on the apply channel.
pub fn handle_install_snapshot(
    state: &mut RaftState,
    req: &InstallSnapshotArgs,
    my_id: u64,
) -> Result<InstallSnapshotReply> {
    req.validate()?;

    if req.term < state.current_term {
        return Ok(InstallSnapshotReply {
            term: state.current_term,
        });
    }

    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    if req.last_included_index <= state.commit_index {
        tracing::debug!(
            node_id = my_id,
            snapshot_index = req.last_included_index,
            commit_index = state.commit_index,
            "Ignoring snapshot already covered by commit index"
        );
        return Ok(InstallSnapshotReply {
            term: state.current_term,
        });
    }

    state.compact_to(
        req.last_included_index,
        req.last_included_term,
        req.data.clone(),
    );
    state.queue_snapshot_delivery();

    tracing::info!(
        node_id = my_id,
        snapshot_index = req.last_included_index,
        snapshot_term = req.last_included_term,
        "Installed snapshot from leader"
    );

    Ok(InstallSnapshotReply {
        term: state.current_term,
    })
}

fn reject(term: u64, conflict_index: u64, conflict_term: Option<u64>) -> AppendEntriesReply {
    AppendEntriesReply {
        term,
        success: false,
        conflict_index,
        conflict_term,
    }
}

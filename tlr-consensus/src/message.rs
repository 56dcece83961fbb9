//! RPC message types exchanged between peers.
//!
//! Field semantics follow the Raft paper; the wire encoding is the host
//! transport's concern, so these are plain owned structs.

use tlr_core::{LogEntry, LogId, NodeId, Term};

/// Candidate's request for a vote in `term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    /// Id of the candidate's last log entry (0 if the log is empty).
    pub last_log_id: LogId,
    /// Term of the candidate's last log entry (0 if the log is empty).
    pub last_log_term: Term,
}

/// Voter's reply. `term` is the voter's current term so a stale candidate
/// can step down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Leader's replication request; doubles as heartbeat when `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Id of the entry immediately preceding `entries` (0 when sending from
    /// the start of the log).
    pub prev_log_id: LogId,
    /// Term of the entry at `prev_log_id` (0 when `prev_log_id` is 0).
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    /// Leader's commit index, for follower commit advancement.
    pub leader_commit_id: LogId,
}

/// Follower's reply. `success` is false on a stale term or a failed
/// log-consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

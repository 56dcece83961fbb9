use bytes::Bytes;

/// Identifier of a node within the fixed cluster map.
pub type NodeId = u32;

/// Election epoch; monotonically increasing, at most one leader per term.
pub type Term = u64;

/// Position of an entry in the replicated log, starting at 1.
/// Id 0 is the "no entry" sentinel and carries term 0.
pub type LogId = u64;

/// A single command in the replicated log.
///
/// Payloads use `Bytes` so that cloning an entry onto the per-peer
/// replication fan-out is a refcount increment, not a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log position assigned by the leader that created the entry.
    pub id: LogId,
    /// Term of the leader that created the entry.
    pub term: Term,
    /// Opaque command payload, applied by the host state machine.
    pub data: Bytes,
}

impl LogEntry {
    #[must_use]
    pub fn new(id: LogId, term: Term, data: Bytes) -> Self {
        Self { id, term, data }
    }
}

//! The error taxonomy for the Raft core.
//!
//! Each variant corresponds to one of the abstract error kinds a conforming
//! implementation must distinguish: a stale term, a log mismatch, a
//! non-leader rejection, a transport failure, a persistence failure, or a
//! malformed message. Callers that need to branch on *kind* (the
//! replication loop deciding whether to retry or step down, for instance)
//! match on this enum directly instead of inspecting an error string.

use thiserror::Error;

use crate::state::NodeId;

#[derive(Debug, Error)]
pub enum RaftError {
    /// The peer's term is behind ours; the request was rejected rather than
    /// acted on.
    #[error("stale term: peer term {peer_term} < our term {our_term}")]
    TermStale { peer_term: u64, our_term: u64 },

    /// `prevLogIndex`/`prevLogTerm` did not match our log.
    #[error("log mismatch at index {index}")]
    LogMismatch { index: u64 },

    /// A client command arrived at a node that is not the leader.
    #[error("not leader (hint: {hint:?})")]
    NotLeader { hint: Option<NodeId> },

    /// Connect, read, write, or timeout failure talking to a peer. Treated
    /// as "no response"; callers retry with backoff.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The durable store could not be fsynced. Fatal: the node must halt
    /// rather than continue with possibly divergent durable state.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A message could not be parsed. The connection is dropped and no
    /// state is mutated.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Malformed(e.to_string())
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Persistence(e.to_string())
    }
}

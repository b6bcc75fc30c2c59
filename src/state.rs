//! Persistent and volatile Raft state: the data in §3 of the design.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RaftError;

pub type NodeId = u64;

/// `host:port` for a cluster member, parsed from `id:host:port` startup
/// triples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.id, self.host, self.port)
    }
}

impl FromStr for Peer {
    type Err = RaftError;

    /// Parses an `id:host:port` triple, e.g. `2:127.0.0.1:7002`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let id = parts
            .next()
            .ok_or_else(|| RaftError::Malformed(format!("missing peer id in '{s}'")))?
            .parse::<NodeId>()
            .map_err(|e| RaftError::Malformed(format!("bad peer id in '{s}': {e}")))?;
        let host = parts
            .next()
            .ok_or_else(|| RaftError::Malformed(format!("missing peer host in '{s}'")))?
            .to_string();
        let port = parts
            .next()
            .ok_or_else(|| RaftError::Malformed(format!("missing peer port in '{s}'")))?
            .parse::<u16>()
            .map_err(|e| RaftError::Malformed(format!("bad peer port in '{s}': {e}")))?;
        Ok(Peer { id, host, port })
    }
}

/// `Role` is one of `Follower`, `Candidate`, `Leader`. Initial = `Follower`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A single log entry. `data` is opaque to the Raft core; only the state
/// machine adapter interprets it. Never mutated once appended; may be
/// truncated from the tail on a follower that detects a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub data: Vec<u8>,
}

/// The replicated log. 1-indexed from the caller's point of view: index 0
/// is never a valid entry index, it denotes "before the start of the log".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: Vec::new() }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 1-based lookup. Returns `None` for index 0 or any index past the end.
    pub fn get(&self, index: u64) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    pub fn last_index(&self) -> u64 {
        self.len()
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Appends a single entry, returning its new 1-based index.
    pub fn append(&mut self, entry: Entry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    pub fn append_all(&mut self, entries: impl IntoIterator<Item = Entry>) -> u64 {
        for e in entries {
            self.entries.push(e);
        }
        self.last_index()
    }

    /// Truncates the log so that only the first `keep` entries (1-based
    /// count) remain. `truncate_from(keep + 1)` in §4.3's terms.
    pub fn truncate_to(&mut self, keep: u64) {
        self.entries.truncate(keep as usize);
    }

    /// Entries starting at 1-based `from` to the end of the log.
    pub fn slice_from(&self, from: u64) -> &[Entry] {
        if from == 0 || from > self.last_index() {
            return &[];
        }
        &self.entries[(from - 1) as usize..]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}

/// `currentTerm`, `votedFor`, and `log[]` — written to stable storage
/// before any RPC reply that depends on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Log,
}

impl PersistentState {
    pub fn new() -> Self {
        PersistentState::default()
    }

    /// `setTerm` semantics: clears `votedFor` whenever the term actually
    /// advances.
    pub fn set_term(&mut self, term: u64) {
        if term > self.current_term {
            self.voted_for = None;
        }
        self.current_term = term;
    }

    pub fn increment_term(&mut self) -> u64 {
        self.current_term += 1;
        self.voted_for = None;
        self.current_term
    }
}

/// `commitIndex`, `lastApplied` — in-memory only, `0 <= lastApplied <=
/// commitIndex <= len(log)`.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Per-peer replication bookkeeping, live only while this node is leader.
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    pub next_index: HashMap<NodeId, u64>,
    pub match_index: HashMap<NodeId, u64>,
}

impl LeaderState {
    pub fn reinitialize(peers: &[Peer], last_log_index: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer.id, last_log_index + 1);
            match_index.insert(peer.id, 0);
        }
        LeaderState { next_index, match_index }
    }
}

//! Wire messages and framing.
//!
//! §4.6 leaves the framing implementation-defined but requires that it
//! preserve exact entry bytes and allow zero or more entries per
//! `AppendEntries`. The source's space-delimited text framing breaks as
//! soon as `data` contains a space; this module instead uses a 4-byte
//! big-endian length prefix followed by a `serde_json`-encoded
//! [`RaftMessage`], following the teacher's `write_u32`/`read_u32` framing
//! idiom from `raft.rs` but with the verb and payload carried as a single
//! typed enum rather than ad-hoc text.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::booking::{RoomId, Slot};
use crate::error::RaftError;
use crate::state::{Entry, NodeId};

/// A message as large as 16 MiB is already well past anything this cluster
/// should ever send; anything larger is treated as malformed rather than
/// trusted to allocate.
const MAX_MESSAGE_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// The replying node's last log index, used by the leader as a
    /// conflict hint to converge `nextIndex` faster than one decrement per
    /// round trip.
    pub last_log_index: u64,
}

/// A client booking command, carried as opaque bytes — the Raft core never
/// interprets `command`, only [`crate::booking`] does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientReply {
    Ok { index: u64 },
    NotLeader { leader_hint: Option<NodeId> },
}

/// A read of the locally applied room table. Answered by whichever node
/// receives it, leader or not — this is a best-effort, non-linearizable
/// read (linearizable reads with a lease are out of scope per §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub rooms: Vec<(RoomId, Vec<Slot>)>,
    pub last_applied: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(VoteRequest),
    RequestVoteReply(VoteReply),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesReply(AppendEntriesReply),
    ClientRequest(ClientRequest),
    ClientReply(ClientReply),
    StatusRequest(StatusRequest),
    StatusReply(StatusReply),
}

pub async fn write_message<W>(writer: &mut W, message: &RaftMessage) -> Result<(), RaftError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() as u64 > MAX_MESSAGE_BYTES as u64 {
        return Err(RaftError::Malformed(format!(
            "outgoing message of {} bytes exceeds {} byte limit",
            bytes.len(),
            MAX_MESSAGE_BYTES
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(reader: &mut R) -> Result<RaftMessage, RaftError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_BYTES {
        return Err(RaftError::Malformed(format!(
            "incoming message of {len} bytes exceeds {MAX_MESSAGE_BYTES} byte limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let message = serde_json::from_slice(&buf)?;
    Ok(message)
}

//! The concrete state machine this cluster replicates: a room-booking
//! table. `Entry.data` is opaque to the Raft core; this module is the only
//! place that interprets those bytes.
//!
//! Grounded in the source system's `room.py` (per-room available/booked
//! hours) and `operation.py` (SQLite-backed room table) — reimplemented
//! here as an in-memory table since the Raft log is already the durable
//! record; replaying it rebuilds the table deterministically.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub type RoomId = u32;
pub type Slot = u32;

/// A command submitted by a client, serialized into `Entry.data` via
/// `serde_json` at the RPC boundary and deserialized again by the adapter
/// when the entry is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingCommand {
    Book { room_id: RoomId, slot: Slot },
    Cancel { room_id: RoomId, slot: Slot },
}

impl BookingCommand {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Safe to unwrap: BookingCommand has no types that fail to serialize.
        serde_json::to_vec(self).expect("BookingCommand serializes infallibly")
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The effect a single applied command had, for observability only — it
/// never feeds back into consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Booked,
    AlreadyBooked,
    Cancelled,
    NotBooked,
}

/// The derived, replicated table of which room/slot pairs are booked.
/// Applying the same command prefix in the same order on any node produces
/// a byte-identical table, with no I/O or wall-clock reads in the apply
/// path.
#[derive(Debug, Clone, Default)]
pub struct RoomState {
    booked: HashMap<RoomId, HashSet<Slot>>,
}

impl RoomState {
    pub fn new() -> Self {
        RoomState::default()
    }

    /// Applies one command. Booking an already-booked slot, or cancelling
    /// one that was never booked, is a deterministic no-op — never a panic,
    /// never an I/O side effect.
    pub fn apply(&mut self, cmd: &BookingCommand) -> ApplyOutcome {
        match *cmd {
            BookingCommand::Book { room_id, slot } => {
                let slots = self.booked.entry(room_id).or_default();
                if slots.insert(slot) {
                    ApplyOutcome::Booked
                } else {
                    ApplyOutcome::AlreadyBooked
                }
            }
            BookingCommand::Cancel { room_id, slot } => {
                if self.booked.get_mut(&room_id).map(|s| s.remove(&slot)).unwrap_or(false) {
                    ApplyOutcome::Cancelled
                } else {
                    ApplyOutcome::NotBooked
                }
            }
        }
    }

    pub fn is_booked(&self, room_id: RoomId, slot: Slot) -> bool {
        self.booked.get(&room_id).map(|s| s.contains(&slot)).unwrap_or(false)
    }

    pub fn booked_slots(&self, room_id: RoomId) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .booked
            .get(&room_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        slots.sort_unstable();
        slots
    }
}

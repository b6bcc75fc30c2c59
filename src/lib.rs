pub mod booking;
pub mod config;
pub mod error;
pub mod messages;
pub mod persist;
pub mod raft;
pub mod state;

pub use booking::{ApplyOutcome, BookingCommand, RoomId, RoomState, Slot};
pub use config::RaftConfig;
pub use error::RaftError;
pub use raft::RaftNode;
pub use state::{NodeId, Peer, Role};

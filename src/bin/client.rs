use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use raft_booking::booking::{BookingCommand, RoomId, Slot};
use raft_booking::messages::{ClientReply, ClientRequest, RaftMessage, StatusReply, StatusRequest};
use raft_booking::raft::call_peer;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "booking-client", version, about, long_about = None)]
struct Cli {
    /// Cluster members to try, each `host:port`. May be repeated.
    #[arg(short, long = "server", global = true)]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Book a room slot.
    Book { room_id: RoomId, slot: Slot },
    /// Cancel a room slot booking.
    Cancel { room_id: RoomId, slot: Slot },
    /// Read the locally applied status of a room from any reachable node.
    /// Not linearizable: the answering node may be behind the leader.
    Status { room_id: RoomId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.servers.is_empty() {
        bail!("at least one --server host:port is required");
    }

    match cli.command {
        Commands::Book { room_id, slot } => {
            submit_command(&cli.servers, BookingCommand::Book { room_id, slot }).await
        }
        Commands::Cancel { room_id, slot } => {
            submit_command(&cli.servers, BookingCommand::Cancel { room_id, slot }).await
        }
        Commands::Status { room_id } => fetch_status(&cli.servers, room_id).await,
    }
}

/// Tries each server in turn, following `NotLeader` hints and retrying the
/// whole list with a short backoff until a leader accepts the command or
/// the attempt budget is exhausted.
async fn submit_command(servers: &[String], command: BookingCommand) -> Result<()> {
    let request = RaftMessage::ClientRequest(ClientRequest { command: command.to_bytes() });

    for attempt in 1..=MAX_ATTEMPTS {
        println!("attempt {attempt} of {MAX_ATTEMPTS}");
        for server in servers {
            print!("  trying {server}... ");
            match call_peer(server, &request).await {
                Ok(RaftMessage::ClientReply(ClientReply::Ok { index })) => {
                    println!("accepted at index {index}");
                    return Ok(());
                }
                Ok(RaftMessage::ClientReply(ClientReply::NotLeader { leader_hint })) => {
                    println!("not leader (hint: {leader_hint:?})");
                }
                Ok(other) => println!("unexpected reply: {other:?}"),
                Err(e) => println!("unreachable: {e}"),
            }
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }

    bail!("no leader accepted the command after {MAX_ATTEMPTS} attempts")
}

async fn fetch_status(servers: &[String], room_id: RoomId) -> Result<()> {
    let request = RaftMessage::StatusRequest(StatusRequest { room_id: Some(room_id) });

    for server in servers {
        match call_peer(server, &request).await {
            Ok(RaftMessage::StatusReply(StatusReply { rooms, last_applied })) => {
                for (id, slots) in rooms {
                    println!("room {id}: booked slots {slots:?} (as of applied index {last_applied})");
                }
                return Ok(());
            }
            Ok(other) => println!("{server}: unexpected reply: {other:?}"),
            Err(e) => println!("{server}: unreachable: {e}"),
        }
    }

    bail!("no server in the list answered the status request")
}

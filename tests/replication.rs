use anyhow::Result;
use raft_booking::booking::BookingCommand;
use raft_booking::config::RaftConfig;
use raft_booking::raft::call_peer;
use raft_booking::state::Peer;
use raft_booking::RaftNode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Spawns the listener loop a `raft-node` binary would run, backed by a
/// real `RaftNode`. Mirrors the dispatch in `src/bin/server.rs`.
async fn spawn_listener(node: Arc<RaftNode>, addr: String) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        if let Ok(msg) = raft_booking::messages::read_message(&mut stream).await {
                            let reply = node.handle_message(msg).await;
                            let _ = raft_booking::messages::write_message(&mut stream, &reply).await;
                        }
                    });
                }
                Err(_) => continue,
            }
        }
    });
    Ok(())
}

async fn build_cluster(base_port: u16, state_dir: &std::path::Path) -> Result<Vec<Arc<RaftNode>>> {
    let ids: Vec<u64> = vec![1, 2, 3];
    let addrs: Vec<(u64, u16)> = ids.iter().map(|&id| (id, base_port + id as u16)).collect();

    let mut nodes = Vec::new();
    for &id in &ids {
        let peers: Vec<Peer> = addrs
            .iter()
            .filter(|(peer_id, _)| *peer_id != id)
            .map(|(peer_id, port)| Peer { id: *peer_id, host: "127.0.0.1".to_string(), port: *port })
            .collect();

        let config = RaftConfig {
            node_id: id,
            listen_host: "127.0.0.1".to_string(),
            listen_port: addrs.iter().find(|(i, _)| *i == id).unwrap().1,
            peers,
            state_path: state_dir.join(format!("node_{id}.bin")),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 30,
            apply_interval_ms: 20,
        };

        let node = RaftNode::new(config).await?;
        spawn_listener(Arc::clone(&node), node.config().listen_addr()).await?;
        node.spawn_background_tasks();
        nodes.push(node);
    }

    Ok(nodes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicates_a_booking_command_to_followers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = build_cluster(9100, dir.path()).await?;

    nodes[0].force_election().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].is_leader().await, "node 1 should have won the forced election");

    nodes[0]
        .propose_booking(BookingCommand::Book { room_id: 101, slot: 9 })
        .await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in &nodes[1..] {
        let entries = node.log_entries().await;
        assert_eq!(entries.len(), 1);
        let cmd = BookingCommand::from_bytes(&entries[0].data)?;
        assert_eq!(cmd, BookingCommand::Book { room_id: 101, slot: 9 });
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commits_and_applies_only_after_majority_replication() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = build_cluster(9200, dir.path()).await?;

    nodes[0].force_election().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].is_leader().await);

    nodes[0]
        .propose_booking(BookingCommand::Book { room_id: 202, slot: 3 })
        .await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(nodes[0].commit_index().await, 1);
    assert_eq!(nodes[0].last_applied().await, 1);
    assert_eq!(nodes[0].booked_slots(202).await, vec![3]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_leader_rejects_client_commands_with_leader_hint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = build_cluster(9300, dir.path()).await?;

    nodes[0].force_election().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].is_leader().await);

    let reply = call_peer(
        &nodes[1].config().listen_addr(),
        &raft_booking::messages::RaftMessage::ClientRequest(raft_booking::messages::ClientRequest {
            command: BookingCommand::Book { room_id: 1, slot: 1 }.to_bytes(),
        }),
    )
    .await?;

    match reply {
        raft_booking::messages::RaftMessage::ClientReply(
            raft_booking::messages::ClientReply::NotLeader { leader_hint },
        ) => {
            assert_eq!(leader_hint, Some(1));
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }

    Ok(())
}

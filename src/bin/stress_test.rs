//! Booking load generator.
//!
//! Run examples:
//! # Run 1000 book requests against a 3-node cluster, 10 concurrent workers
//! cargo run --bin stress -- -n 1000 -t 10 -s 127.0.0.1:7001 -s 127.0.0.1:7002 -s 127.0.0.1:7003
//!
//! # With custom retry backoff and verbose output
//! cargo run --bin stress -- -n 5000 -t 20 -s 127.0.0.1:7001 -r 8 --retry-backoff-ms 200 -v

use clap::Parser;
use raft_booking::booking::BookingCommand;
use raft_booking::messages::{ClientReply, ClientRequest, RaftMessage};
use raft_booking::raft::call_peer;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Parser, Clone)]
#[command(version, about = "Load generator for the booking cluster", long_about = None)]
struct Cli {
    /// Number of booking requests to send
    #[arg(short = 'n', long, default_value = "1000")]
    num_requests: usize,

    /// Number of concurrent workers
    #[arg(short = 't', long, default_value = "10")]
    num_threads: usize,

    /// Cluster members to try, each `host:port`. May be repeated.
    #[arg(short = 's', long = "server")]
    servers: Vec<String>,

    /// Room id commands are issued against
    #[arg(long, default_value = "101")]
    room_id: u32,

    /// Delay between requests per worker (milliseconds)
    #[arg(short = 'd', long, default_value = "0")]
    delay_ms: u64,

    /// Maximum retry attempts per request, cycling through all servers each time
    #[arg(short = 'r', long, default_value = "5")]
    max_retries: usize,

    /// Base delay for exponential backoff (milliseconds)
    #[arg(long, default_value = "100")]
    retry_backoff_ms: u64,

    /// Enable verbose per-request output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Debug)]
struct TestStatistics {
    total_requests: AtomicUsize,
    successful_requests: AtomicUsize,
    failed_requests: AtomicUsize,

    total_retries: AtomicUsize,
    requests_with_retries: AtomicUsize,

    connection_errors: AtomicUsize,
    not_leader_errors: AtomicUsize,
    other_errors: AtomicUsize,

    total_response_time_ms: AtomicU64,
    min_response_time_ms: AtomicU64,
    max_response_time_ms: AtomicU64,
    response_times: Mutex<Vec<u64>>,

    leader_changes: AtomicUsize,
    last_known_leader: Mutex<Option<String>>,

    start_time: Instant,
}

#[derive(Debug, Clone, Copy)]
enum ErrorType {
    Connection,
    NotLeader,
    Other,
}

impl TestStatistics {
    fn new() -> Self {
        TestStatistics {
            total_requests: AtomicUsize::new(0),
            successful_requests: AtomicUsize::new(0),
            failed_requests: AtomicUsize::new(0),
            total_retries: AtomicUsize::new(0),
            requests_with_retries: AtomicUsize::new(0),
            connection_errors: AtomicUsize::new(0),
            not_leader_errors: AtomicUsize::new(0),
            other_errors: AtomicUsize::new(0),
            total_response_time_ms: AtomicU64::new(0),
            min_response_time_ms: AtomicU64::new(u64::MAX),
            max_response_time_ms: AtomicU64::new(0),
            response_times: Mutex::new(Vec::new()),
            leader_changes: AtomicUsize::new(0),
            last_known_leader: Mutex::new(None),
            start_time: Instant::now(),
        }
    }

    fn record_success(&self, response_time_ms: u64, leader: String, retry_count: usize) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms.fetch_add(response_time_ms, Ordering::Relaxed);

        if retry_count > 0 {
            self.requests_with_retries.fetch_add(1, Ordering::Relaxed);
            self.total_retries.fetch_add(retry_count, Ordering::Relaxed);
        }

        self.min_response_time_ms.fetch_min(response_time_ms, Ordering::Relaxed);
        self.max_response_time_ms.fetch_max(response_time_ms, Ordering::Relaxed);
        self.response_times.lock().unwrap().push(response_time_ms);

        let mut last_leader = self.last_known_leader.lock().unwrap();
        if let Some(ref prev) = *last_leader {
            if prev != &leader {
                self.leader_changes.fetch_add(1, Ordering::Relaxed);
            }
        }
        *last_leader = Some(leader);
    }

    fn record_failure(&self, error_type: ErrorType, retry_count: usize) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        if retry_count > 0 {
            self.requests_with_retries.fetch_add(1, Ordering::Relaxed);
            self.total_retries.fetch_add(retry_count, Ordering::Relaxed);
        }
        match error_type {
            ErrorType::Connection => self.connection_errors.fetch_add(1, Ordering::Relaxed),
            ErrorType::NotLeader => self.not_leader_errors.fetch_add(1, Ordering::Relaxed),
            ErrorType::Other => self.other_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn print_report(&self) {
        let total = self.total_requests.load(Ordering::Relaxed);
        let success = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let total_time = self.start_time.elapsed().as_secs_f64();

        println!("\n=== STRESS TEST RESULTS ===");
        println!("Total Requests:        {total}");
        if total > 0 {
            println!("Successful:            {success} ({:.2}%)", success as f64 / total as f64 * 100.0);
            println!("Failed:                {failed} ({:.2}%)", failed as f64 / total as f64 * 100.0);
        }
        println!("Test Duration:         {total_time:.2} seconds");
        println!("Throughput:            {:.2} requests/second", total as f64 / total_time);

        let total_retries = self.total_retries.load(Ordering::Relaxed);
        let requests_with_retries = self.requests_with_retries.load(Ordering::Relaxed);
        println!("\n--- Retry statistics ---");
        println!("Total Retries:         {total_retries}");
        println!("Requests with Retries: {requests_with_retries}");

        println!("\n--- Error breakdown ---");
        println!("Connection Errors:     {}", self.connection_errors.load(Ordering::Relaxed));
        println!("NotLeader Errors:      {}", self.not_leader_errors.load(Ordering::Relaxed));
        println!("Other Errors:          {}", self.other_errors.load(Ordering::Relaxed));

        if success > 0 {
            let avg = self.total_response_time_ms.load(Ordering::Relaxed) / success as u64;
            println!("\n--- Response time ---");
            println!("Average:               {avg} ms");
            println!("Minimum:               {} ms", self.min_response_time_ms.load(Ordering::Relaxed));
            println!("Maximum:               {} ms", self.max_response_time_ms.load(Ordering::Relaxed));

            let mut times = self.response_times.lock().unwrap();
            times.sort_unstable();
            if !times.is_empty() {
                let pct = |p: usize| times[(times.len() * p / 100).min(times.len() - 1)];
                println!("p50:                   {} ms", pct(50));
                println!("p90:                   {} ms", pct(90));
                println!("p99:                   {} ms", pct(99));
            }
        }

        println!("\n--- Leader election ---");
        println!("Leader Changes:        {}", self.leader_changes.load(Ordering::Relaxed));
        if let Some(ref leader) = *self.last_known_leader.lock().unwrap() {
            println!("Final Leader:          {leader}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.servers.is_empty() {
        anyhow::bail!("at least one --server host:port is required");
    }

    let stats = Arc::new(TestStatistics::new());
    let semaphore = Arc::new(Semaphore::new(cli.num_threads));
    let mut handles = Vec::with_capacity(cli.num_requests);

    for i in 0..cli.num_requests {
        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();
        let cli = cli.clone();
        let stats = Arc::clone(&stats);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            if cli.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(cli.delay_ms)).await;
            }
            let slot = (i % 24) as u32;
            run_one_request(&cli, &stats, slot).await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    stats.print_report();
    Ok(())
}

async fn run_one_request(cli: &Cli, stats: &TestStatistics, slot: u32) {
    let command = BookingCommand::Book { room_id: cli.room_id, slot };
    let request = RaftMessage::ClientRequest(ClientRequest { command: command.to_bytes() });

    let mut retries = 0;
    let started = Instant::now();

    loop {
        for server in &cli.servers {
            match call_peer(server, &request).await {
                Ok(RaftMessage::ClientReply(ClientReply::Ok { index })) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    if cli.verbose {
                        println!("  OK index={index} via {server} ({elapsed}ms, {retries} retries)");
                    }
                    stats.record_success(elapsed, server.clone(), retries);
                    return;
                }
                Ok(RaftMessage::ClientReply(ClientReply::NotLeader { leader_hint })) => {
                    if cli.verbose {
                        println!("  {server} not leader (hint: {leader_hint:?})");
                    }
                    stats.record_failure(ErrorType::NotLeader, retries);
                }
                Ok(other) => {
                    if cli.verbose {
                        println!("  {server} unexpected reply: {other:?}");
                    }
                    stats.record_failure(ErrorType::Other, retries);
                }
                Err(e) => {
                    if cli.verbose {
                        println!("  {server} unreachable: {e}");
                    }
                    stats.record_failure(ErrorType::Connection, retries);
                }
            }
        }

        retries += 1;
        if retries > cli.max_retries {
            return;
        }
        let backoff = cli.retry_backoff_ms * (1 << retries.min(6));
        tokio::time::sleep(Duration::from_millis(backoff)).await;
    }
}

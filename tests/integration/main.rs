//! Gather integration test harness.
//!
//! Every test runs real sender agents and a real receiver coordinator on
//! loopback. Broadcast is not available on `lo`, so the receiver sends its
//! REQUEST to each sender's discovery port directly; everything after
//! discovery is identical to a LAN run.
//!
//!   cargo test --test integration
//!
//! Each test takes its own block of ports so tests can run in parallel.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use gather_core::SenderId;
use gather_services::{ReceiverCoordinator, ReceiverSettings, SenderAgent, SenderSettings};

mod failures;
mod transfer;

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Ports per test: senders at base+id, discovery at base+20+i, chunks at base+40.
const PORT_BLOCK: u16 = 50;

/// Blocks one test binary may take. Must cover every test in the crate.
const BLOCKS_PER_RUN: u16 = 16;

/// Process slots between the first port and the kernel's ephemeral range.
const PROCESS_SLOTS: u32 = 15;

const FIRST_PORT: u16 = 20_000;

static NEXT_BLOCK: AtomicU16 = AtomicU16::new(0);

/// A fresh port block. Each process gets a disjoint run of blocks, chosen
/// by pid, so concurrent test binaries only collide on equal pid slots.
pub fn port_block() -> u16 {
    let n = NEXT_BLOCK.fetch_add(1, Ordering::SeqCst);
    assert!(n < BLOCKS_PER_RUN, "raise BLOCKS_PER_RUN: {n} tests need ports");
    let slot = (std::process::id() % PROCESS_SLOTS) as u16;
    FIRST_PORT + (slot * BLOCKS_PER_RUN + n) * PORT_BLOCK
}

// ── Scratch directories ───────────────────────────────────────────────────────

/// Temporary directory removed on drop, even if the test panics.
pub struct Scratch {
    pub root: PathBuf,
}

impl Scratch {
    pub fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!("gather-it-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    /// Input directory for sender `id`.
    pub fn input(&self, id: SenderId) -> PathBuf {
        let dir = self.root.join(format!("sender-{id}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn output(&self) -> PathBuf {
        self.root.join("output")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Deterministic content that contains the ':' delimiter and NUL bytes.
pub fn sample_content(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| match i % 13 {
            0 => b':',
            5 => 0,
            n => (i * 31 + n) as u8,
        })
        .collect()
}

pub fn put_file(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).unwrap();
}

// ── Cluster ───────────────────────────────────────────────────────────────────

/// A set of running senders sharing one port block. Stops them on drop.
pub struct Cluster {
    pub base_port: u16,
    pub shutdown: broadcast::Sender<()>,
    pub discovery_targets: Vec<SocketAddr>,
    pub tasks: Vec<gather_services::SenderTasks>,
}

impl Cluster {
    pub fn new(base_port: u16) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            base_port,
            shutdown,
            discovery_targets: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn transfer_port(&self) -> u16 {
        self.base_port + 40
    }

    /// Next free discovery port in this block.
    pub fn next_discovery_port(&self) -> u16 {
        self.base_port + 20 + self.discovery_targets.len() as u16
    }

    /// Start a real sender serving `input_dir`.
    pub fn start_sender(&mut self, id: SenderId, input_dir: PathBuf) {
        let discovery_port = self.next_discovery_port();
        let agent = SenderAgent::new(
            id,
            SenderSettings {
                input_dir,
                discovery_port,
                base_port: self.base_port,
                transfer_port: self.transfer_port(),
            },
        );
        let tasks = agent.spawn(&self.shutdown).expect("sender should bind");
        self.discovery_targets
            .push(SocketAddr::from((Ipv4Addr::LOCALHOST, discovery_port)));
        self.tasks.push(tasks);
    }

    /// Register a hand-rolled discovery responder instead of a real sender.
    pub async fn fake_responder(&mut self, replies: Vec<Vec<u8>>) {
        let port = self.next_discovery_port();
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        self.discovery_targets
            .push(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, from)) = socket.recv_from(&mut buf).await {
                for reply in replies {
                    let _ = socket.send_to(&reply, from).await;
                }
            }
        });
    }

    pub fn receiver(&self, output_dir: PathBuf, receive_timeout: Option<Duration>) -> ReceiverCoordinator {
        ReceiverCoordinator::new(ReceiverSettings {
            discovery_targets: self.discovery_targets.clone(),
            discovery_timeout: Duration::from_millis(400),
            base_port: self.base_port,
            transfer_port: self.transfer_port(),
            advertise_addr: Some(Ipv4Addr::LOCALHOST),
            output_dir,
            receive_timeout,
        })
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

#[test]
fn port_blocks_stay_below_ephemeral_range() {
    let highest = FIRST_PORT as u32
        + (PROCESS_SLOTS * BLOCKS_PER_RUN as u32) * PORT_BLOCK as u32;
    assert!(highest <= 32_768);
}

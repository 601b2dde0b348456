//! Receiver coordinator — drives one transfer from broadcast to assembled file.
//!
//! Phases run strictly in sequence, never overlapping:
//!
//!   1. discover   broadcast REQUEST, collect ACKs until the deadline
//!   2. assign     partition the file across the responders
//!   3. dispatch   one ASSIGN connection per sender, in response order
//!   4. receive    accept CHUNK connections one at a time until complete
//!   5. assemble   write the ranges out in file order
//!
//! The transfer listener is bound before dispatch so no chunk can arrive
//! ahead of it.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use gather_core::config::GatherConfig;
use gather_core::partition::{dedup_senders, size_disagreements};
use gather_core::wire::{self, ChunkPayload, Message, SenderId, BUFFER_SIZE};
use gather_core::{assign, ChunkAssignment, SenderDescriptor};

use crate::chunk_store::{ChunkStore, InsertOutcome};
use crate::net;
use crate::progress::ProgressReporter;

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    /// Where the REQUEST datagram goes. Normally the single broadcast address.
    pub discovery_targets: Vec<SocketAddr>,
    pub discovery_timeout: Duration,
    pub base_port: u16,
    pub transfer_port: u16,
    /// Address placed in ASSIGN. `None` = ask the routing table.
    pub advertise_addr: Option<Ipv4Addr>,
    pub output_dir: PathBuf,
    /// Overall limit on chunk reception. `None` = block until complete.
    pub receive_timeout: Option<Duration>,
}

impl ReceiverSettings {
    pub fn from_config(config: &GatherConfig) -> Self {
        let broadcast = SocketAddr::from((
            config.network.broadcast_addr,
            config.network.discovery_port,
        ));
        Self {
            discovery_targets: vec![broadcast],
            discovery_timeout: config.transfer.discovery_timeout(),
            base_port: config.network.base_port,
            transfer_port: config.network.transfer_port,
            advertise_addr: config.network.advertise_addr,
            output_dir: config.transfer.output_dir.clone(),
            receive_timeout: config.transfer.receive_timeout(),
        }
    }
}

/// Which senders were handed their assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<SenderId>,
    pub failed: Vec<SenderId>,
}

/// Result of a completed transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub file_size: u64,
    pub assignments: Vec<ChunkAssignment>,
    pub dispatch: DispatchReport,
}

/// Transfer-level failures, distinct from per-peer faults that are only logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("no senders hold {0:?}")]
    NoSenders(String),

    #[error("timed out after {received}/{expected} chunks, missing senders {missing:?}")]
    ReceiveTimedOut {
        received: usize,
        expected: usize,
        missing: Vec<SenderId>,
    },
}

pub struct ReceiverCoordinator {
    settings: ReceiverSettings,
}

impl ReceiverCoordinator {
    pub fn new(settings: ReceiverSettings) -> Self {
        Self { settings }
    }

    /// Run every phase for `filename`.
    pub async fn run(
        &self,
        filename: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<TransferOutcome> {
        let discovered = self.discover(filename).await?;
        if discovered.is_empty() {
            return Err(TransferError::NoSenders(filename.to_string()).into());
        }

        let before = discovered.len();
        let senders = dedup_senders(discovered);
        if senders.len() != before {
            tracing::warn!(
                dropped = before - senders.len(),
                "duplicate ACKs for the same sender id ignored"
            );
        }
        for odd in size_disagreements(&senders) {
            tracing::warn!(
                sender_id = odd.id,
                reported = odd.file_size,
                using = senders[0].file_size,
                "sender reports a different size, first sender wins"
            );
        }

        let assignments = assign(&senders);
        let listener = self.bind_transfer_listener()?;
        let receiver_addr = self.advertise_addr()?;
        let dispatch = self.dispatch(&assignments, receiver_addr).await;

        let mut store = ChunkStore::new(filename, &assignments);
        self.receive_chunks(&listener, &mut store, progress).await?;
        let path = store.write_to(&self.settings.output_dir).await?;

        Ok(TransferOutcome {
            path,
            file_size: store.file_size(),
            assignments,
            dispatch,
        })
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Broadcast one REQUEST and collect ACKs until the timeout elapses.
    ///
    /// Always waits the full timeout. Duplicate ACKs are returned as-is.
    pub async fn discover(&self, filename: &str) -> Result<Vec<SenderDescriptor>> {
        let socket = net::broadcast_socket().await?;
        let request = Message::Request {
            filename: filename.to_string(),
        }
        .encode()?;
        let deadline = Instant::now() + self.settings.discovery_timeout;

        tracing::info!(filename, targets = ?self.settings.discovery_targets, "broadcasting request");
        for target in &self.settings.discovery_targets {
            if let Err(e) = socket.send_to(&request, target).await {
                tracing::warn!(%target, error = %e, "request send failed");
            }
        }

        let mut senders = Vec::new();
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            let (len, from) =
                match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                };

            match Message::parse(&buf[..len]) {
                Ok(Message::Ack {
                    sender_id,
                    filename: acked,
                    file_size,
                }) if acked == filename => {
                    tracing::debug!(sender_id, %from, file_size, "ACK received");
                    senders.push(SenderDescriptor {
                        id: sender_id,
                        addr: from,
                        filename: acked,
                        file_size,
                    });
                }
                Ok(Message::Ack { filename: acked, .. }) => {
                    tracing::debug!(%from, filename = %acked, "ignoring ACK for another file");
                }
                Ok(other) => tracing::trace!(%from, tag = other.tag(), "ignoring datagram"),
                Err(e) => tracing::trace!(%from, error = %e, "ignoring unparseable datagram"),
            }
        }

        tracing::info!(filename, count = senders.len(), "discovery finished");
        Ok(senders)
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Bind the chunk listener. Must happen before `dispatch`.
    pub fn bind_transfer_listener(&self) -> Result<TcpListener> {
        let listener = net::tcp_listener(self.settings.transfer_port)
            .context("failed to bind transfer listener")?;
        tracing::info!(port = self.settings.transfer_port, "listening for chunks");
        Ok(listener)
    }

    /// Address senders should push chunks back to.
    pub fn advertise_addr(&self) -> Result<Ipv4Addr> {
        if let Some(addr) = self.settings.advertise_addr {
            return Ok(addr);
        }
        let probe = self
            .settings
            .discovery_targets
            .first()
            .copied()
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::BROADCAST, wire::DEFAULT_PORT)));
        net::local_ipv4(probe).context("failed to determine local address")
    }

    /// Send each assignment over its own connection, in order.
    ///
    /// A sender that cannot be reached is logged and skipped; the others
    /// still get their assignment.
    pub async fn dispatch(
        &self,
        assignments: &[ChunkAssignment],
        receiver_addr: Ipv4Addr,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for a in assignments {
            match self.send_assignment(a, receiver_addr).await {
                Ok(()) => {
                    tracing::info!(sender_id = a.sender_id, range = %a.range, "assignment sent");
                    report.delivered.push(a.sender_id);
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    tracing::warn!(sender_id = a.sender_id, error = %reason, "assignment not delivered");
                    report.failed.push(a.sender_id);
                }
            }
        }
        report
    }

    async fn send_assignment(&self, a: &ChunkAssignment, receiver_addr: Ipv4Addr) -> Result<()> {
        let port = wire::assignment_port(self.settings.base_port, a.sender_id)?;
        let dest = SocketAddr::new(a.addr.ip(), port);
        let message = Message::Assign {
            sender_id: a.sender_id,
            filename: a.filename.clone(),
            range: a.range,
            receiver_addr,
        }
        .encode()?;

        let mut stream = TcpStream::connect(dest)
            .await
            .with_context(|| format!("failed to connect to {dest}"))?;
        stream.write_all(&message).await.context("failed to send assignment")?;
        stream.shutdown().await.context("failed to close assignment stream")?;
        Ok(())
    }

    // ── Reception ────────────────────────────────────────────────────────────

    /// Receive chunks into `store` until it is complete, or until the
    /// configured reception timeout elapses.
    pub async fn receive_chunks(
        &self,
        listener: &TcpListener,
        store: &mut ChunkStore,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let Some(limit) = self.settings.receive_timeout else {
            return receive_chunks(listener, store, progress).await;
        };

        let result = tokio::time::timeout(limit, receive_chunks(listener, &mut *store, progress)).await;
        match result {
            Ok(result) => result,
            Err(_) => {
                progress.finish();
                Err(TransferError::ReceiveTimedOut {
                    received: store.received(),
                    expected: store.expected(),
                    missing: store.missing(),
                }
                .into())
            }
        }
    }
}

/// Accept chunk connections one at a time until every assigned sender has
/// delivered. Each connection carries one framed CHUNK and ends at EOF.
///
/// Malformed or rejected deliveries are logged and do not count. With no
/// timeout around it, a sender that never delivers blocks this forever.
pub async fn receive_chunks(
    listener: &TcpListener,
    store: &mut ChunkStore,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let limit = store.max_frame_len();

    while !store.is_complete() {
        let (stream, peer) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                net::accept_backoff(&e).await;
                continue;
            }
        };

        // One byte past the limit tells an oversized frame from a full one.
        let frame = match net::read_until_close(stream, limit.saturating_add(1)).await {
            Ok(f) if f.len() > limit => {
                tracing::warn!(%peer, limit, "oversized chunk dropped");
                continue;
            }
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "failed to read chunk");
                continue;
            }
        };

        let chunk = match ChunkPayload::decode(Bytes::from(frame)) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed chunk received");
                continue;
            }
        };

        let sender_id = chunk.sender_id;
        let range = chunk.range;
        match store.insert(chunk) {
            Ok(InsertOutcome::New) => {
                tracing::debug!(sender_id, range = %range, %peer, "chunk received");
                progress.report(store.received(), store.expected());
            }
            Ok(InsertOutcome::Replaced) => {
                tracing::warn!(sender_id, %peer, "duplicate chunk replaced earlier delivery");
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "chunk rejected");
            }
        }
    }

    progress.finish();
    Ok(())
}

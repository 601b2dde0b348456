//! Sender agent — answers discovery and serves assigned byte ranges.
//!
//! Two independent loops, each on its own socket:
//!
//!   discovery responder   REQUEST → (file present?) → ACK | silence
//!   assignment listener   ASSIGN  → (id matches?) → read range → CHUNK
//!
//! Each loop handles one datagram or connection at a time. Failures are
//! logged and the loop carries on. Both stop on the shutdown signal.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use gather_core::config::GatherConfig;
use gather_core::wire::{self, ByteRange, ChunkPayload, Message, SenderId, WireError, BUFFER_SIZE};

use crate::net;

/// Where a sender serves files from and which ports it uses.
#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub input_dir: PathBuf,
    pub discovery_port: u16,
    pub base_port: u16,
    /// Receiver's chunk port, combined with the address carried in ASSIGN.
    pub transfer_port: u16,
}

impl SenderSettings {
    pub fn from_config(config: &GatherConfig) -> Self {
        Self {
            input_dir: config.transfer.input_dir.clone(),
            discovery_port: config.network.discovery_port,
            base_port: config.network.base_port,
            transfer_port: config.network.transfer_port,
        }
    }
}

/// Handles for the two running loops.
pub struct SenderTasks {
    pub responder: JoinHandle<Result<()>>,
    pub listener: JoinHandle<Result<()>>,
}

pub struct SenderAgent {
    id: SenderId,
    settings: SenderSettings,
}

impl SenderAgent {
    pub fn new(id: SenderId, settings: SenderSettings) -> Self {
        Self { id, settings }
    }

    pub fn id(&self) -> SenderId {
        self.id
    }

    /// TCP port this sender takes its assignment on.
    pub fn assignment_port(&self) -> Result<u16, WireError> {
        wire::assignment_port(self.settings.base_port, self.id)
    }

    /// Bind both sockets, then run each loop as its own task.
    ///
    /// Bind failures are returned before anything is spawned.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Result<SenderTasks> {
        let discovery = net::discovery_socket(self.settings.discovery_port)
            .context("failed to bind discovery socket")?;
        let assignment_port = self.assignment_port()?;
        let assignments =
            net::tcp_listener(assignment_port).context("failed to bind assignment listener")?;

        tracing::info!(
            sender_id = self.id,
            discovery_port = self.settings.discovery_port,
            assignment_port,
            input_dir = %self.settings.input_dir.display(),
            "sender ready"
        );

        let agent = Arc::new(self);
        let responder = {
            let agent = agent.clone();
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { agent.run_discovery_responder(discovery, shutdown).await })
        };
        let listener = {
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { agent.run_assignment_listener(assignments, shutdown).await })
        };

        Ok(SenderTasks {
            responder,
            listener,
        })
    }

    // ── Discovery responder ──────────────────────────────────────────────────

    pub async fn run_discovery_responder(
        &self,
        socket: UdpSocket,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(sender_id = self.id, "discovery responder shutting down");
                    return Ok(());
                }

                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };

                    let Some(ack) = self.answer_request(&buf[..len]).await else {
                        continue;
                    };
                    if let Err(e) = self.send_ack(&socket, &ack, peer).await {
                        tracing::warn!(sender_id = self.id, %peer, error = %e, "ACK send failed");
                    }
                }
            }
        }
    }

    /// Build the ACK for a REQUEST datagram, or `None` to stay silent.
    pub async fn answer_request(&self, datagram: &[u8]) -> Option<Message> {
        let filename = match Message::parse(datagram) {
            Ok(Message::Request { filename }) => filename,
            Ok(other) => {
                tracing::debug!(tag = other.tag(), "ignoring non-request datagram");
                return None;
            }
            Err(WireError::UnknownTag(tag)) => {
                tracing::trace!(tag = %tag, "ignoring unknown message tag");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed datagram");
                return None;
            }
        };

        let Some(path) = self.local_path(&filename) else {
            tracing::warn!(sender_id = self.id, filename = %filename, "refusing non-bare filename");
            return None;
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(Message::Ack {
                sender_id: self.id,
                filename,
                file_size: meta.len(),
            }),
            _ => {
                tracing::info!(sender_id = self.id, filename = %filename, "file not found");
                None
            }
        }
    }

    async fn send_ack(&self, socket: &UdpSocket, ack: &Message, peer: SocketAddr) -> Result<()> {
        let bytes = ack.encode()?;
        socket.send_to(&bytes, peer).await?;
        if let Message::Ack {
            filename,
            file_size,
            ..
        } = ack
        {
            tracing::info!(
                sender_id = self.id,
                %peer,
                filename = %filename,
                file_size,
                "ACK sent"
            );
        }
        Ok(())
    }

    // ── Assignment listener ──────────────────────────────────────────────────

    pub async fn run_assignment_listener(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(sender_id = self.id, "assignment listener shutting down");
                    return Ok(());
                }

                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            net::accept_backoff(&e).await;
                            continue;
                        }
                    };

                    let message = match net::read_until_close(stream, BUFFER_SIZE).await {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "failed to read assignment");
                            continue;
                        }
                    };

                    if let Err(e) = self.handle_assignment(&message).await {
                        let reason = format!("{e:#}");
                        tracing::warn!(sender_id = self.id, %peer, error = %reason, "chunk not sent");
                    }
                }
            }
        }
    }

    /// Serve one ASSIGN message. Returns the range sent, or `None` when the
    /// assignment was addressed to another sender.
    pub async fn handle_assignment(&self, message: &[u8]) -> Result<Option<ByteRange>> {
        let (filename, range, receiver_addr) =
            match Message::parse(message).context("malformed assignment")? {
                Message::Assign { sender_id, .. } if sender_id != self.id => {
                    tracing::debug!(
                        sender_id = self.id,
                        addressed_to = sender_id,
                        "ignoring assignment for another sender"
                    );
                    return Ok(None);
                }
                Message::Assign {
                    filename,
                    range,
                    receiver_addr,
                    ..
                } => (filename, range, receiver_addr),
                other => bail!("expected ASSIGN, got {}", other.tag()),
            };

        let path = self
            .local_path(&filename)
            .with_context(|| format!("refusing non-bare filename {filename:?}"))?;
        let data = read_range(&path, range).await?;
        let frame = ChunkPayload::new(self.id, filename, range, data)?.encode()?;

        let dest = SocketAddr::from((receiver_addr, self.settings.transfer_port));
        let mut stream = TcpStream::connect(dest)
            .await
            .with_context(|| format!("failed to connect to receiver at {dest}"))?;
        stream.write_all(&frame).await.context("failed to send chunk")?;
        stream.shutdown().await.context("failed to close chunk stream")?;

        tracing::info!(
            sender_id = self.id,
            range = %range,
            bytes = range.len(),
            receiver = %dest,
            "chunk sent"
        );

        Ok(Some(range))
    }

    /// Resolve a requested name inside the input directory. Only bare file
    /// names are served.
    fn local_path(&self, filename: &str) -> Option<PathBuf> {
        let name = Path::new(filename).file_name()?;
        if name != filename {
            return None;
        }
        Some(self.settings.input_dir.join(name))
    }
}

/// Read exactly `range` from the file at `path`.
async fn read_range(path: &Path, range: ByteRange) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(range.start))
        .await
        .with_context(|| format!("failed to seek to {}", range.start))?;

    let len = usize::try_from(range.len()).context("range too large for memory")?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)
        .await
        .with_context(|| format!("failed to read {range} of {}", path.display()))?;
    Ok(Bytes::from(data))
}

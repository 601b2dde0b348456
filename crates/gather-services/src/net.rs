//! Socket construction for the discovery and transfer channels.
//!
//! socket2 is used where tokio does not expose the options we need
//! before bind (SO_REUSEADDR, SO_BROADCAST).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Pause after a failed accept so a persistent error such as EMFILE
/// does not spin the loop.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// UDP socket on `0.0.0.0:port` that receives broadcast datagrams.
///
/// SO_REUSEADDR lets several senders on one host share the discovery port;
/// every one of them sees each broadcast.
pub fn discovery_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("bind() udp {bind_addr}"))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed to convert to tokio UdpSocket")
}

/// Ephemeral UDP socket allowed to send to a broadcast address.
pub async fn broadcast_socket() -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind() broadcast socket")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    Ok(socket)
}

/// TCP listener on `0.0.0.0:port`.
pub fn tcp_listener(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("socket()")?;

    // Rebinding right after a previous run must not fail on TIME_WAIT.
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("bind() tcp {bind_addr}"))?;
    socket.listen(128).context("listen()")?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).context("failed to convert to tokio TcpListener")
}

/// Read until the peer closes, accepting at most `limit` bytes.
pub async fn read_until_close(stream: TcpStream, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream
        .take(limit as u64)
        .read_to_end(&mut buf)
        .await
        .context("read failed")?;
    Ok(buf)
}

/// Log a failed accept and wait before the caller retries.
pub async fn accept_backoff(error: &std::io::Error) {
    tracing::warn!(error = %error, "accept failed");
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}

/// Local IPv4 address the kernel would use to reach `probe`.
///
/// No packet is sent: connecting a UDP socket only consults the routing table.
pub fn local_ipv4(probe: SocketAddr) -> Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;
    socket
        .connect(probe)
        .with_context(|| format!("no route to {probe}"))?;
    match socket.local_addr()? {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Ok(*v4.ip()),
        other => bail!("expected a routable IPv4 local address, got {other}"),
    }
}

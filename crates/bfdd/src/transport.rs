//! Datagram transport behind the session layer.
//!
//! The registry and engine talk to [`Transport`] and [`SessionTransport`]
//! only, so tests can capture outbound packets without touching the network.
//! [`UdpTransport`] is the production implementation: one connected UDP
//! socket per session, bound to a high source port, TTL 255 on everything
//! we send (RFC 5881 §5).

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SendError, TransportError};
use crate::types::{
    SessionKey, BFD_CONTROL_PORT, BFD_CONTROL_TTL, BFD_SRCPORT_INIT, BFD_SRCPORT_MAX,
    NUM_BFD_SRCPORT_RETRIES,
};

/// Callback invoked with each datagram received on a session's socket.
/// Implementations must be cheap and non-blocking; the engine's sink only
/// enqueues the bytes onto its command channel.
pub type InboundSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Factory for per-session transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a channel toward `key.peer`, delivering received datagrams to
    /// `sink` until the returned handle is dropped.
    async fn open(
        &self,
        key: &SessionKey,
        local_addr: Option<IpAddr>,
        sink: InboundSink,
    ) -> Result<Box<dyn SessionTransport>, TransportError>;
}

/// Send side of one session's channel. Dropping it closes the channel and
/// stops inbound delivery.
pub trait SessionTransport: Send + Sync {
    /// Sends one control packet. Must not block the caller.
    fn send(&self, payload: &[u8]) -> Result<(), SendError>;

    /// Local port the channel is bound to.
    fn local_port(&self) -> u16;
}

/// UDP transport for single-hop BFD (RFC 5881).
#[derive(Debug, Clone)]
pub struct UdpTransport {
    control_port: u16,
    source_port: Option<u16>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            control_port: BFD_CONTROL_PORT,
            source_port: None,
        }
    }

    /// Overrides the destination port. Intended for tests that run two
    /// engines against each other on loopback.
    pub fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    /// Pins the source port instead of picking one at random.
    pub fn with_source_port(mut self, port: u16) -> Self {
        self.source_port = Some(port);
        self
    }

    async fn bind_socket(&self, local_ip: IpAddr) -> Result<UdpSocket, TransportError> {
        if let Some(port) = self.source_port {
            return Ok(UdpSocket::bind(SocketAddr::new(local_ip, port)).await?);
        }
        // RFC 5881 §4: source port in the dynamic range, unique per session.
        // Random draw with a bounded number of retries on collision. The rng
        // handle must not live across the bind await, it is not Send.
        for _ in 0..NUM_BFD_SRCPORT_RETRIES {
            let port = rand::thread_rng().gen_range(BFD_SRCPORT_INIT..=BFD_SRCPORT_MAX);
            match UdpSocket::bind(SocketAddr::new(local_ip, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port, "source port in use, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TransportError::SourcePortExhausted(NUM_BFD_SRCPORT_RETRIES))
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(
        &self,
        key: &SessionKey,
        local_addr: Option<IpAddr>,
        sink: InboundSink,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        let local_ip = local_addr.unwrap_or(match key.peer {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let socket = self.bind_socket(local_ip).await?;
        apply_ttl(&socket, key.peer)?;
        socket
            .connect(SocketAddr::new(key.peer, self.control_port))
            .await?;

        let socket = Arc::new(socket);
        let recv_socket = Arc::clone(&socket);
        let recv_key = key.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match recv_socket.recv(&mut buf).await {
                    Ok(len) => sink(buf[..len].to_vec()),
                    Err(e) => {
                        // Connected UDP sockets surface ICMP errors here;
                        // the detection timer handles the actual failure.
                        debug!(key = %recv_key, error = %e, "recv error");
                    }
                }
            }
        });

        Ok(Box::new(UdpSessionTransport { socket, recv_task }))
    }
}

/// Sets the outgoing TTL (v4) or hop limit (v6) to 255 per RFC 5881 §5.
/// `set_ttl` only touches `IP_TTL`, so v6 sockets go through socket2.
fn apply_ttl(socket: &UdpSocket, peer: IpAddr) -> io::Result<()> {
    match peer {
        IpAddr::V4(_) => socket.set_ttl(BFD_CONTROL_TTL),
        IpAddr::V6(_) => socket2::SockRef::from(socket).set_unicast_hops_v6(BFD_CONTROL_TTL),
    }
}

struct UdpSessionTransport {
    socket: Arc<UdpSocket>,
    recv_task: JoinHandle<()>,
}

impl SessionTransport for UdpSessionTransport {
    fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        match self.socket.try_send(payload) {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::HostUnreachable
                        | io::ErrorKind::NetworkUnreachable
                        | io::ErrorKind::PermissionDenied
                ) =>
            {
                Err(SendError::Unreachable)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // A full socket buffer loses one periodic packet; the next
                // cycle retries.
                warn!("send buffer full, dropping control packet");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }
}

impl Drop for UdpSessionTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

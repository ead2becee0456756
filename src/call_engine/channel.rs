//! UDP Datagram Channel
//!
//! Thin transport between two peers:
//! - `DatagramSender`: unconnected outbound socket, one datagram per frame
//! - `DatagramReceiver`: socket bound to the local receive port. A pending
//!   receive can be cancelled from another task through a `ReceiverCloser`.
//!
//! No ordering, delivery or congestion guarantees are made.

use super::wire::{WireFormat, MAX_DATAGRAM_SIZE};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to send datagram to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to receive datagram: {0}")]
    Receive(#[source] io::Error),

    /// The receiver was closed locally while waiting
    #[error("Receive socket closed")]
    Closed,

    #[error("No datagram received for {0:?}")]
    IdleTimeout(Duration),

    #[error("Could not resolve host '{0}'")]
    Resolve(String),
}

impl ChannelError {
    /// Errors caused by a local stop, never reported as failures
    pub fn is_expected_shutdown(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// Remote peer address as entered by the user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// True when host and port are filled in
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    /// Resolves the host to a socket address, preferring IPv4
    pub async fn resolve(&self) -> Result<SocketAddr, ChannelError> {
        let host = self.host.trim();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|_| ChannelError::Resolve(host.to_string()))?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ChannelError::Resolve(host.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Wildcard address of the same family as `peer`
pub fn unspecified_for(peer: &SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

// ============================================================================
// SENDER
// ============================================================================

/// Outbound half of a session, owned by the send loop
pub struct DatagramSender {
    socket: UdpSocket,
    remote: SocketAddr,
    format: WireFormat,
    scratch: Vec<u8>,
}

impl DatagramSender {
    /// Opens an unconnected socket on an ephemeral port
    pub fn open(remote: SocketAddr, format: WireFormat) -> Result<Self, ChannelError> {
        let local = unspecified_for(&remote, 0);
        let socket = UdpSocket::bind(local).map_err(|source| ChannelError::Bind {
            addr: local,
            source,
        })?;

        tracing::debug!(
            "Datagram sender opened on {:?} -> {}",
            socket.local_addr().ok(),
            remote
        );

        Ok(Self {
            socket,
            remote,
            format,
            scratch: Vec::new(),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// True when `audio` would reach the peer as a hang-up
    pub fn collides_with_sentinel(&self, audio: &[u8]) -> bool {
        self.format.collides_with_sentinel(audio)
    }

    /// Sends one audio frame, returns the number of audio bytes sent
    pub fn send_audio(&mut self, audio: &[u8]) -> Result<usize, ChannelError> {
        self.format.encode_audio_into(audio, &mut self.scratch);
        let sent = self
            .socket
            .send_to(&self.scratch, self.remote)
            .map_err(|source| ChannelError::Send {
                addr: self.remote,
                source,
            })?;
        Ok(sent.saturating_sub(self.format.header_len()))
    }

    /// Sends the hang-up datagram on this socket
    pub fn send_end_call(&self) -> Result<(), ChannelError> {
        let datagram = self.format.end_call_datagram();
        self.socket
            .send_to(&datagram, self.remote)
            .map(|_| ())
            .map_err(|source| ChannelError::Send {
                addr: self.remote,
                source,
            })
    }
}

/// Sends a single hang-up datagram from a fresh socket, closed afterwards
pub async fn send_end_call_once(remote: SocketAddr, format: WireFormat) -> Result<(), ChannelError> {
    let local = unspecified_for(&remote, 0);
    let socket = tokio::net::UdpSocket::bind(local)
        .await
        .map_err(|source| ChannelError::Bind {
            addr: local,
            source,
        })?;

    socket
        .send_to(&format.end_call_datagram(), remote)
        .await
        .map_err(|source| ChannelError::Send {
            addr: remote,
            source,
        })?;

    Ok(())
}

// ============================================================================
// RECEIVER
// ============================================================================

/// Inbound half of a session, owned by the receive loop
#[derive(Debug)]
pub struct DatagramReceiver {
    socket: tokio::net::UdpSocket,
    buf: Vec<u8>,
    shutdown: CancellationToken,
    idle_timeout: Option<Duration>,
}

/// Handle that unblocks a pending `DatagramReceiver::receive`
#[derive(Debug, Clone)]
pub struct ReceiverCloser(CancellationToken);

impl ReceiverCloser {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl DatagramReceiver {
    /// Binds the receive socket. Must be called inside a Tokio runtime.
    ///
    /// `capacity` is the largest datagram accepted; longer ones are truncated.
    pub fn bind(addr: SocketAddr, capacity: usize) -> Result<Self, ChannelError> {
        let bind_err = |source| ChannelError::Bind { addr, source };

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;

        // No SO_REUSEADDR: a second call on a busy port must fail to bind.
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: UdpSocket = socket.into();
        let socket = tokio::net::UdpSocket::from_std(std_socket).map_err(bind_err)?;

        tracing::debug!("Datagram receiver bound on {:?}", socket.local_addr().ok());

        Ok(Self {
            socket,
            buf: vec![0u8; capacity.clamp(1, MAX_DATAGRAM_SIZE + 1)],
            shutdown: CancellationToken::new(),
            idle_timeout: None,
        })
    }

    /// Gives up waiting after `timeout` without any datagram
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn closer(&self) -> ReceiverCloser {
        ReceiverCloser(self.shutdown.clone())
    }

    /// Waits for one datagram and returns its payload trimmed to the received length
    pub async fn receive(&mut self) -> Result<(&[u8], SocketAddr), ChannelError> {
        let idle_timeout = self.idle_timeout;

        loop {
            let idle = async move {
                match idle_timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ChannelError::Closed),
                _ = idle => {
                    return Err(ChannelError::IdleTimeout(idle_timeout.unwrap_or_default()))
                }
                result = self.socket.recv_from(&mut self.buf) => result,
            };

            match received {
                Ok((len, from)) => return Ok((&self.buf[..len], from)),
                // Windows reports ICMP port-unreachable for earlier sends as a
                // receive error; the socket itself is still usable.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    tracing::trace!("Ignoring connection reset on receive socket");
                }
                Err(e) => return Err(ChannelError::Receive(e)),
            }
        }
    }
}

// ============================================================================
// LOCAL ADDRESS
// ============================================================================

/// Local IP of the interface that routes to the outside, for display only
///
/// Nothing is sent: connecting a UDP socket only consults the routing table.
pub fn local_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    Ok(socket.local_addr()?.ip())
}

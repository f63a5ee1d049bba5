use crate::config::{AddressResolveError, NetworkConfig};
use crate::discovery::{DiscoveryCodecError, DiscoveryMessage, MAX_DATAGRAM_SIZE};
use std::io;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to resolve discovery address")]
    Resolve(#[from] AddressResolveError),

    #[error("Failed to bind discovery socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Invalid multicast interface '{0}'")]
    InvalidInterface(String),

    #[error("Failed to join multicast group {group}")]
    JoinGroup {
        group: IpAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to send discovery datagram to {addr}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Discovery listener failed to receive")]
    Receive(#[source] io::Error),

    #[error(transparent)]
    Codec(#[from] DiscoveryCodecError),
}

/// A decoded datagram and where it came from.
#[derive(Debug, Clone)]
pub(crate) struct ReceivedAnnouncement {
    pub(crate) source: SocketAddr,
    pub(crate) message: DiscoveryMessage,
}

/// Sends one announcement to the configured group from a throwaway socket. Fire and forget.
pub async fn broadcast(config: &NetworkConfig, message: &DiscoveryMessage) -> Result<(), DiscoveryError> {
    let payload = message.encode()?;
    let target = config.group_addr().await?;
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(local)
        .await
        .map_err(|source| DiscoveryError::Bind { addr: local, source })?;
    socket
        .send_to(&payload, target)
        .await
        .map_err(|source| DiscoveryError::Send { addr: target, source })?;

    Ok(())
}

/// Listens for announcements until `shutdown` is cancelled, pushing decoded ones onto
/// `announcements`. `ready` receives the bound address once the socket is listening.
///
/// Bind failures and receive errors end the listener with an error. Malformed datagrams are
/// logged and dropped. When the consumer can't keep up, announcements are dropped; they repeat.
pub(crate) async fn serve_discovery(
    logger: slog::Logger,
    config: NetworkConfig,
    announcements: mpsc::Sender<ReceivedAnnouncement>,
    ready: oneshot::Sender<SocketAddr>,
    shutdown: CancellationToken,
) -> Result<(), DiscoveryError> {
    let socket = bind_listener(&config).await?;
    let local_addr = socket
        .local_addr()
        .map_err(|source| DiscoveryError::Bind {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
            source,
        })?;
    slog::info!(logger, "Discovery listening on {:?}", local_addr);
    let _ = ready.send(local_addr);

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, source) = tokio::select! {
            _ = shutdown.cancelled() => {
                slog::info!(logger, "Discovery listener shutting down");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => received.map_err(DiscoveryError::Receive)?,
        };

        let message = match DiscoveryMessage::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                slog::warn!(logger, "Dropping {} byte datagram from {}: {}", len, source, e);
                continue;
            }
        };
        slog::debug!(logger, "Announcement from {}: {:?}", source, message);

        match announcements.try_send(ReceivedAnnouncement { source, message }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                slog::debug!(logger, "Announcement queue is full; dropping announcement from {}", source);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                slog::info!(logger, "Announcement consumer has gone away");
                return Ok(());
            }
        }
    }
}

async fn bind_listener(config: &NetworkConfig) -> Result<UdpSocket, DiscoveryError> {
    let group = config.group_addr().await?;
    let listen_addr = config.listen_addr().await?;
    let bound = if group.ip().is_multicast() {
        bind_shared(listen_addr)
    } else {
        UdpSocket::bind(listen_addr).await
    };
    let socket = bound.map_err(|source| DiscoveryError::Bind {
        addr: listen_addr,
        source,
    })?;

    match group.ip() {
        IpAddr::V4(group_ip) if group_ip.is_multicast() => {
            let interface = match &config.interface {
                Some(interface) => interface
                    .parse::<Ipv4Addr>()
                    .map_err(|_| DiscoveryError::InvalidInterface(interface.clone()))?,
                None => Ipv4Addr::UNSPECIFIED,
            };
            socket
                .join_multicast_v4(group_ip, interface)
                .map_err(|source| DiscoveryError::JoinGroup {
                    group: group.ip(),
                    source,
                })?;
        }
        IpAddr::V6(group_ip) if group_ip.is_multicast() => {
            socket
                .join_multicast_v6(&group_ip, 0)
                .map_err(|source| DiscoveryError::JoinGroup {
                    group: group.ip(),
                    source,
                })?;
        }
        // Plain unicast address: nothing to join.
        _ => {}
    }

    Ok(socket)
}

// Every node on a host listens on the same group port, so the port is shared.
fn bind_shared(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into())
}

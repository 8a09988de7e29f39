//! UDP transport and receive loops.
//!
//! One unicast socket carries all node traffic, including the multicast
//! announcements it sends. When local discovery is enabled a second
//! socket joins the multicast group to hear other nodes' announcements.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use tether_core::wire::MULTICAST_GROUP;
use tether_services::{Node, Transport, TransportError};

const RECV_BUFFER: usize = 65_536;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, bytes: Bytes) -> BoxFuture<'static, Result<(), TransportError>> {
        let socket = self.socket.clone();
        Box::pin(async move {
            socket
                .send_to(&bytes, to)
                .await
                .map(|_| ())
                .map_err(|source| TransportError::Send { to, source })
        })
    }
}

/// Bind the node's unicast socket. `SO_REUSEADDR` lets it share the
/// multicast port with the group socket.
pub fn bind_unicast(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).with_context(|| format!("bind({addr})"))?;
    if addr.is_ipv4() {
        socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;
    }
    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

/// Create a socket joined to the local discovery multicast group.
pub fn bind_multicast() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_GROUP.port());
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket
        .join_multicast_v4(MULTICAST_GROUP.ip(), &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

/// Feed every datagram on `socket` to the node until shutdown.
pub async fn recv_loop(
    name: &'static str,
    socket: Arc<UdpSocket>,
    node: Node,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; RECV_BUFFER];
    tracing::info!(socket = name, addr = %socket.local_addr()?, "receive loop starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(socket = name, "receive loop shutting down");
                return Ok(());
            }

            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(socket = name, error = %e, "recv_from failed");
                        continue;
                    }
                };
                if let Err(e) = node.receive(from, Bytes::copy_from_slice(&buf[..len])) {
                    if e.is_admission_rejection() {
                        tracing::trace!(%from, error = %e, "frame rejected");
                    } else {
                        tracing::debug!(%from, error = %e, "frame dropped");
                    }
                }
            }
        }
    }
}

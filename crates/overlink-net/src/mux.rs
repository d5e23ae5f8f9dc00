//! Shared UDP multiplexer
//!
//! The tunnel driver binds one UDP socket and shares it with the NAT
//! traversal machinery. After startup the handle is read-only: tasks clone
//! it freely, nobody rebinds it.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::NetResult;

/// Handle to the shared UDP socket.
#[derive(Clone)]
pub struct UdpMux {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpMux {
    /// Bind the multiplexer on the given port; port 0 picks an ephemeral one.
    pub async fn bind(port: u16) -> NetResult<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, "udp mux bound");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> NetResult<usize> {
        Ok(self.socket.send_to(buf, target).await?)
    }

    /// Receive one datagram.
    pub async fn recv_from(&self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

impl std::fmt::Debug for UdpMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpMux").field("local_addr", &self.local_addr).finish()
    }
}

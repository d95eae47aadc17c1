//! Async datagram socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that routes
//! every outbound datagram through a [`Channel`].  It is byte-oriented:
//! framing is the job of [`crate::frame`] and [`crate::segment`].  All
//! protocol logic lives elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::simulator::{Channel, Fate, Perfect};

/// Largest datagram we ever expect to read.
const MAX_DATAGRAM: usize = 65_535;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An async UDP socket whose sends pass through a [`Channel`].
///
/// All methods take `&self` so the socket can be shared with delayed-send
/// tasks.
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    channel: Arc<dyn Channel>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Bind a socket with a transparent channel.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        Self::bind_with(local_addr, Arc::new(Perfect)).await
    }

    /// Bind a socket whose outbound datagrams are shaped by `channel`.
    pub async fn bind_with(
        local_addr: SocketAddr,
        channel: Arc<dyn Channel>,
    ) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            channel,
        })
    }

    /// Hand `datagram` to the channel for delivery to `dest`.
    ///
    /// Lost datagrams succeed silently.  Delayed datagrams are sent from a
    /// detached task; a failure there is logged, never reported.
    pub async fn send_to(&self, datagram: Vec<u8>, dest: SocketAddr) -> Result<(), SocketError> {
        match self.channel.shape(datagram) {
            Fate::Drop => Ok(()),
            Fate::Deliver { datagram, delay } if delay.is_zero() => {
                self.inner.send_to(&datagram, dest).await?;
                Ok(())
            }
            Fate::Deliver { datagram, delay } => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = inner.send_to(&datagram, dest).await {
                        log::debug!("[socket] delayed send to {dest} failed: {e}");
                    }
                });
                Ok(())
            }
        }
    }

    /// Receive the next datagram as `(bytes, sender_address)`.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Like [`recv_from`](Self::recv_from) but gives up after `wait`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub async fn recv_timeout(
        &self,
        wait: Duration,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, SocketError> {
        match tokio::time::timeout(wait, self.recv_from()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

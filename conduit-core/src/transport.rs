//! Datagram transports
//!
//! A [`Transport`] sends whole datagrams to its peer and receives whole
//! datagrams with a bounded wait. [`UdpTransport`] is the production
//! implementation; [`MemoryLink`] connects two endpoints in-process with an
//! optional loss pattern and backs simulation and tests.

use crate::error::ConduitError;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "logging")]
use tracing::debug;

/// Unreliable, unordered datagram channel to one peer
pub trait Transport: Send + Sync {
    /// Send one datagram
    fn send(&self, data: &[u8]) -> Result<(), ConduitError>;

    /// Receive one datagram into `buf`, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, ConduitError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, data: &[u8]) -> Result<(), ConduitError> {
        (**self).send(data)
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, ConduitError> {
        (**self).recv_timeout(buf, timeout)
    }
}

/// UDP transport over two sockets: one sending to the peer, one bound locally
#[derive(Debug)]
pub struct UdpTransport {
    outbound: UdpSocket,
    inbound: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Send to `peer` and receive on `local`
    pub fn connect<A: ToSocketAddrs, B: ToSocketAddrs>(peer: A, local: B) -> Result<Self, ConduitError> {
        let peer = peer.to_socket_addrs()?.next().ok_or_else(|| {
            ConduitError::InvalidParameter("peer address did not resolve".to_string())
        })?;

        let unspecified: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let outbound = UdpSocket::bind(unspecified)?;
        let inbound = UdpSocket::bind(local)?;

        #[cfg(feature = "logging")]
        debug!(
            "UDP transport: sending to {}, receiving on {}",
            peer,
            inbound.local_addr()?
        );

        Ok(Self {
            outbound,
            inbound,
            peer,
        })
    }

    /// Peer address datagrams are sent to
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the receiving socket
    pub fn local_addr(&self) -> Result<SocketAddr, ConduitError> {
        Ok(self.inbound.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn send(&self, data: &[u8]) -> Result<(), ConduitError> {
        self.outbound.send_to(data, self.peer)?;
        Ok(())
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, ConduitError> {
        // A zero read timeout means "block forever" to the OS
        let timeout = timeout.max(Duration::from_millis(1));
        self.inbound.set_read_timeout(Some(timeout))?;

        match self.inbound.recv_from(buf) {
            Ok((n, _)) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decides whether the `n`th datagram sent on an endpoint is dropped
pub type LossFilter = dyn Fn(u64, &[u8]) -> bool + Send + Sync;

/// One end of an in-process datagram link
pub struct MemoryLink {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    loss: Option<Arc<LossFilter>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryLink {
    /// Two connected endpoints
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (Self::endpoint(a_tx, a_rx), Self::endpoint(b_tx, b_rx))
    }

    fn endpoint(tx: Sender<Bytes>, rx: Receiver<Bytes>) -> Self {
        Self {
            tx,
            rx,
            loss: None,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Drop outgoing datagrams for which `filter(n, data)` returns true
    pub fn with_loss<F>(mut self, filter: F) -> Self
    where
        F: Fn(u64, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.loss = Some(Arc::new(filter));
        self
    }

    /// Datagrams handed to `send`, dropped ones included
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Datagrams dropped by the loss filter
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take a datagram if one is waiting
    pub fn try_recv(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("sent", &self.sent())
            .field("dropped", &self.dropped())
            .field("lossy", &self.loss.is_some())
            .finish()
    }
}

impl Transport for MemoryLink {
    fn send(&self, data: &[u8]) -> Result<(), ConduitError> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed);
        if let Some(loss) = &self.loss {
            if loss(n, data) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        // Like UDP, sending to a vanished peer is not an error
        let _ = self.tx.send(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, ConduitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(Some(n))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ConduitError::ChannelClosed),
        }
    }
}

//! Transport endpoint — a bound UDP socket with a fixed remote peer.
//!
//! Owns send/receive primitives only. Both channels build on this, each with
//! their own endpoint(s), so gaze traffic never shares a socket buffer with
//! control handshakes.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::NetError;

pub struct Endpoint {
    socket: UdpSocket,
    local: SocketAddr,
    remote: SocketAddr,
    degraded: bool,
}

impl Endpoint {
    /// Bind to `local`, sending to `remote`.
    ///
    /// If `local` names a specific address that cannot be bound, falls back to
    /// the wildcard address on the same port and marks the endpoint degraded.
    /// Only a failed fallback is an error. Must be called inside a Tokio
    /// runtime.
    pub fn bind(local: SocketAddr, remote: SocketAddr, buffer_bytes: usize) -> Result<Self, NetError> {
        let (socket, degraded) = match make_socket(local, buffer_bytes) {
            Ok(s) => (s, false),
            Err(e) if !local.ip().is_unspecified() => {
                let wildcard = SocketAddr::new(unspecified_like(local.ip()), local.port());
                tracing::warn!(
                    addr = %local,
                    fallback = %wildcard,
                    error = %e,
                    "bind failed, falling back to wildcard address"
                );
                let s = make_socket(wildcard, buffer_bytes).map_err(|source| NetError::Bind {
                    addr: wildcard,
                    source,
                })?;
                (s, true)
            }
            Err(source) => return Err(NetError::Bind { addr: local, source }),
        };

        let socket = UdpSocket::from_std(socket.into()).map_err(|source| NetError::Bind {
            addr: local,
            source,
        })?;
        let local = socket
            .local_addr()
            .map_err(|source| NetError::Bind { addr: local, source })?;

        tracing::debug!(%local, %remote, degraded, "endpoint bound");
        Ok(Self {
            socket,
            local,
            remote,
            degraded,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// True when the configured address was unavailable and the wildcard
    /// address is in use instead.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub async fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, self.remote).await
    }

    /// Send to an address other than the fixed remote, e.g. a reply.
    pub async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(bytes, target).await
    }

    /// Non-blocking send. A full socket buffer surfaces as `WouldBlock`.
    pub fn try_send(&self, bytes: &[u8]) -> io::Result<usize> {
        self.socket.try_send_to(bytes, self.remote)
    }

    /// Receive one datagram, or `Ok(None)` if nothing arrives within `timeout`.
    pub async fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        }
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn make_socket(addr: SocketAddr, buffer_bytes: usize) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if buffer_bytes > 0 {
        if let Err(e) = socket.set_send_buffer_size(buffer_bytes) {
            tracing::debug!(error = %e, "SO_SNDBUF not applied");
        }
        if let Err(e) = socket.set_recv_buffer_size(buffer_bytes) {
            tracing::debug!(error = %e, "SO_RCVBUF not applied");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

// ── Background receive task ───────────────────────────────────────────────────

/// Handle to a channel's background receive loop.
///
/// The loop observes the shutdown broadcast between receive attempts.
/// `stop` may be called any number of times; only the first does anything.
pub(crate) struct ReceiveTask {
    shutdown: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ReceiveTask {
    /// Spawn `body`, handing it a shutdown receiver subscribed before it starts.
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(body(rx));
        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Signal the loop, then wait up to `join_wait` before aborting it.
    /// Either way the loop's future, and anything it captured, has been
    /// dropped when this returns. Returns false if this task was already
    /// stopped.
    pub(crate) async fn stop(&self, join_wait: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.shutdown.send(());
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(join_wait, &mut handle).await.is_err() {
                tracing::warn!(?join_wait, "receive loop did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        true
    }
}

impl Drop for ReceiveTask {
    fn drop(&mut self) {
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

//! Control channel — typed, timestamped handshakes between the two peers.
//!
//! One endpoint, one background receive loop feeding the [`Inbox`]. Pings are
//! answered from the loop itself. Sends are fire-and-forget with a bounded
//! retry on local transport errors only; there is no delivery guarantee.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use dyad_core::config::TimingConfig;
use dyad_core::wire::{
    now_secs, ControlMessage, Envelope, HeartbeatReply, MessageKind, MAX_DATAGRAM,
};

use crate::endpoint::{Endpoint, ReceiveTask};
use crate::error::NetError;
use crate::inbox::{Inbox, Message};
use crate::session::SessionContext;

pub struct ControlChannel {
    /// Taken on close so the socket is released with the receive loop.
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    local: SocketAddr,
    degraded: bool,
    inbox: Arc<Inbox>,
    ctx: Arc<SessionContext>,
    attempts: u32,
    backoff: Duration,
    close_join: Duration,
    receiver: ReceiveTask,
}

impl ControlChannel {
    /// Bind the control endpoint and start its receive loop.
    pub fn bind(
        local: SocketAddr,
        remote: SocketAddr,
        buffer_bytes: usize,
        ctx: Arc<SessionContext>,
        timing: &TimingConfig,
    ) -> Result<Self, NetError> {
        let endpoint = Arc::new(Endpoint::bind(local, remote, buffer_bytes)?);
        let inbox = Arc::new(Inbox::new());

        let receiver = ReceiveTask::spawn({
            let endpoint = endpoint.clone();
            let inbox = inbox.clone();
            let ctx = ctx.clone();
            let recv_timeout = timing.recv_timeout();
            move |shutdown| receive_loop(endpoint, inbox, ctx, recv_timeout, shutdown)
        });

        tracing::info!(
            local = %endpoint.local_addr(),
            %remote,
            degraded = endpoint.is_degraded(),
            "control channel up"
        );

        Ok(Self {
            local: endpoint.local_addr(),
            degraded: endpoint.is_degraded(),
            endpoint: Mutex::new(Some(endpoint)),
            inbox,
            ctx,
            attempts: timing.send_attempts.max(1),
            backoff: timing.retry_backoff(),
            close_join: timing.close_join(),
            receiver,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Encode `body` with the current time and transmit it, retrying up to
    /// `max_attempts` times on transport errors.
    pub async fn send(&self, body: ControlMessage, max_attempts: u32) -> Result<(), NetError> {
        let endpoint = match self.endpoint() {
            Some(ep) if !self.receiver.is_closed() => ep,
            _ => return Err(NetError::Closed),
        };
        let kind = body.kind();
        let bytes = Envelope::now(body).encode()?;
        let max_attempts = max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match endpoint.send(&bytes).await {
                Ok(_) => {
                    self.ctx.control_stats.record_sent();
                    tracing::debug!(%kind, attempt, "control message sent");
                    return Ok(());
                }
                Err(e) if attempt < max_attempts => {
                    tracing::debug!(%kind, attempt, error = %e, "control send failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
                Err(source) => {
                    self.ctx.control_stats.record_send_error();
                    tracing::warn!(%kind, attempts = attempt, error = %source, "control send failed");
                    return Err(NetError::Transport {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// [`send`](Self::send) with the configured attempt count.
    pub async fn post(&self, body: ControlMessage) -> Result<(), NetError> {
        self.send(body, self.attempts).await
    }

    pub async fn wait_for(&self, kind: MessageKind, timeout: Duration) -> Option<Message> {
        self.inbox.wait_for(kind, timeout).await
    }

    pub async fn poll(&self, timeout: Duration) -> Option<Message> {
        self.inbox.poll(timeout).await
    }

    /// Non-blocking [`wait_for`](Self::wait_for).
    pub fn take(&self, kind: MessageKind) -> Option<Message> {
        self.inbox.take(kind)
    }

    /// True if a message of `kind` is queued. Does not consume it.
    pub fn has(&self, kind: MessageKind) -> bool {
        self.inbox.contains(kind)
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Stop the receive loop and release the socket. Later calls are
    /// no-ops; sends after close fail with [`NetError::Closed`].
    pub async fn close(&self) {
        let stopped = self.receiver.stop(self.close_join).await;
        let released = self
            .endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(released);
        if stopped {
            tracing::info!(stats = ?self.ctx.control_stats.snapshot(), "control channel closed");
        }
    }
}

async fn receive_loop(
    endpoint: Arc<Endpoint>,
    inbox: Arc<Inbox>,
    ctx: Arc<SessionContext>,
    recv_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let result = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("control receive loop shutting down");
                return;
            }
            result = endpoint.recv_timeout(&mut buf, recv_timeout) => result,
        };

        let (len, sender_addr) = match result {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                ctx.control_stats.record_recv_error();
                tracing::warn!(error = %e, "control recv failed");
                continue;
            }
        };

        let envelope = match Envelope::decode(&buf[..len]) {
            Ok(e) => e,
            Err(e) => {
                ctx.control_stats.record_decode_error();
                tracing::warn!(%sender_addr, len, error = %e, "dropping undecodable control datagram");
                continue;
            }
        };
        ctx.control_stats.record_received();

        let msg = Message {
            timestamp: envelope.timestamp,
            body: envelope.body,
            sender_addr,
            receipt_time: now_secs(),
        };
        tracing::debug!(kind = %msg.kind(), %sender_addr, "control message received");

        if msg.kind() == MessageKind::Ping {
            reply_pong(&endpoint, &ctx, sender_addr).await;
        }
        inbox.push(msg);
    }
}

async fn reply_pong(endpoint: &Endpoint, ctx: &SessionContext, to: SocketAddr) {
    let pong = Envelope::now(ControlMessage::Pong(HeartbeatReply { client_ready: true }));
    let bytes = match pong.encode() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode pong");
            return;
        }
    };
    match endpoint.send_to(&bytes, to).await {
        Ok(_) => ctx.control_stats.record_sent(),
        Err(e) => {
            ctx.control_stats.record_send_error();
            tracing::warn!(%to, error = %e, "pong send failed");
        }
    }
}

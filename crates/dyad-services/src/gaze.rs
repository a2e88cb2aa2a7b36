//! Gaze channel — best-effort streaming of gaze positions.
//!
//! Sends go out through their own endpoint to the peer's listen port; the
//! receive loop listens on ours and runs regardless of the local sharing
//! flag. Nothing is buffered: the receiver keeps only the newest sample.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use dyad_core::config::{NetworkConfig, TimingConfig};
use dyad_core::wire::{now_secs, GazeSample, MAX_DATAGRAM};

use crate::endpoint::{Endpoint, ReceiveTask};
use crate::error::NetError;
use crate::session::{RemoteGaze, SessionContext};

pub struct GazeChannel {
    /// Dropped on close, releasing the send port.
    tx: Mutex<Option<Endpoint>>,
    tx_addr: SocketAddr,
    rx_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    seq: AtomicU64,
    close_join: Duration,
    receiver: ReceiveTask,
}

impl GazeChannel {
    /// Bind the listen endpoint on `listen` and a send endpoint on an
    /// ephemeral port of `send_from`, targeting `remote`.
    pub fn bind(
        send_from: IpAddr,
        listen: SocketAddr,
        remote: SocketAddr,
        ctx: Arc<SessionContext>,
        timing: &TimingConfig,
    ) -> Result<Self, NetError> {
        let rx = Arc::new(Endpoint::bind(listen, remote, 0)?);
        let tx = Endpoint::bind(SocketAddr::new(send_from, 0), remote, 0)?;
        let rx_addr = rx.local_addr();

        let receiver = ReceiveTask::spawn({
            let ctx = ctx.clone();
            let recv_timeout = timing.recv_timeout();
            move |shutdown| receive_loop(rx, ctx, recv_timeout, shutdown)
        });

        tracing::info!(listen = %rx_addr, %remote, "gaze channel up");

        Ok(Self {
            tx_addr: tx.local_addr(),
            tx: Mutex::new(Some(tx)),
            rx_addr,
            ctx,
            seq: AtomicU64::new(0),
            close_join: timing.close_join(),
            receiver,
        })
    }

    /// Bind using the addresses in `network`.
    pub fn from_config(
        network: &NetworkConfig,
        ctx: Arc<SessionContext>,
        timing: &TimingConfig,
    ) -> Result<Self, NetError> {
        Self::bind(
            network.local_addr,
            network.gaze_local(),
            network.gaze_remote(),
            ctx,
            timing,
        )
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.rx_addr
    }

    pub fn send_addr(&self) -> SocketAddr {
        self.tx_addr
    }

    pub fn set_sharing(&self, active: bool) {
        self.ctx.set_sharing(active);
    }

    pub fn sharing(&self) -> bool {
        self.ctx.sharing()
    }

    /// Tag subsequent samples with `trial`.
    pub fn set_trial(&self, trial: Option<u32>) {
        self.ctx.set_gaze_trial(trial);
    }

    /// Transmit one sample if sharing is on. Returns true if a datagram was
    /// handed to the socket. Never fails: errors are counted and dropped.
    pub fn submit_sample(&self, x: f64, y: f64, valid: bool) -> bool {
        if !self.ctx.sharing() || self.receiver.is_closed() {
            return false;
        }
        let sample = GazeSample {
            x,
            y,
            valid,
            timestamp: now_secs(),
            origin: self.ctx.role(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            trial: self.ctx.gaze_trial(),
        };
        let bytes = match sample.encode() {
            Ok(b) => b,
            Err(e) => {
                self.ctx.gaze_stats.record_send_error();
                tracing::trace!(error = %e, "gaze encode failed");
                return false;
            }
        };
        let sent = match self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            Some(tx) => tx.try_send(&bytes),
            None => return false,
        };
        match sent {
            Ok(_) => {
                self.ctx.gaze_stats.record_sent();
                tracing::trace!(seq = sample.seq, trial = ?sample.trial, "gaze sample sent");
                true
            }
            Err(e) => {
                self.ctx.gaze_stats.record_send_error();
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::trace!(error = %e, "gaze send failed");
                }
                false
            }
        }
    }

    pub fn last_remote_sample(&self) -> Option<RemoteGaze> {
        self.ctx.last_remote_sample()
    }

    /// Stop sharing and the receive loop, and release both ports.
    pub async fn close(&self) {
        self.ctx.set_sharing(false);
        let stopped = self.receiver.stop(self.close_join).await;
        let released = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(released);
        if stopped {
            tracing::info!(stats = ?self.ctx.gaze_stats.snapshot(), "gaze channel closed");
        }
    }
}

async fn receive_loop(
    endpoint: Arc<Endpoint>,
    ctx: Arc<SessionContext>,
    recv_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let result = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("gaze receive loop shutting down");
                return;
            }
            result = endpoint.recv_timeout(&mut buf, recv_timeout) => result,
        };

        let len = match result {
            Ok(Some((len, _))) => len,
            Ok(None) => continue,
            Err(e) => {
                ctx.gaze_stats.record_recv_error();
                tracing::trace!(error = %e, "gaze recv failed");
                continue;
            }
        };

        let sample = match GazeSample::decode(&buf[..len]) {
            Ok(s) => s,
            Err(e) => {
                ctx.gaze_stats.record_decode_error();
                tracing::warn!(len, error = %e, "dropping undecodable gaze datagram");
                continue;
            }
        };
        if sample.origin == ctx.role() {
            tracing::trace!("ignoring own gaze sample");
            continue;
        }

        ctx.gaze_stats.record_received();
        if !ctx.accept_remote(sample) {
            ctx.gaze_stats.record_stale();
        }
    }
}

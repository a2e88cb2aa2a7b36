//! Error taxonomy for the networked core.
//!
//! Per-datagram problems (decode failures, a single failed gaze send) never
//! surface here; they are counted in [`crate::ChannelStats`] and dropped.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use dyad_core::wire::{MessageKind, WireError};

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Neither the configured address nor the wildcard fallback could be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    /// The local transmit call kept failing. Says nothing about delivery.
    #[error("send failed after {attempts} attempt(s): {source}")]
    Transport { attempts: u32, source: io::Error },

    #[error("channel is closed")]
    Closed,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Reasons a session stops before its last trial.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An awaited handshake never arrived. The two peers no longer agree on
    /// which stage they are in.
    #[error("timed out after {after:?} waiting for {waiting_for}")]
    HandshakeTimeout {
        waiting_for: MessageKind,
        after: Duration,
    },

    #[error("aborted by operator")]
    Aborted,

    #[error("peer ended the session")]
    PeerEnded { reason: Option<String> },

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

//! Session context — the state both channels and the coordinator share.
//!
//! The coordinator owns it; the channels hold an `Arc` and only touch it
//! through the methods here. The gating flag and counters are atomics, the
//! last-remote-sample map is a DashMap keyed by origin.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use dyad_core::wire::{now_secs, GazeSample, PeerRole};

/// Sequence numbers further back than this are taken as a sender restart
/// rather than a late packet.
const SEQ_RESTART_WINDOW: u64 = 1024;

const NO_TRIAL: u64 = u64::MAX;

// ── Counters ──────────────────────────────────────────────────────────────────

/// Per-channel traffic counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent: AtomicU64,
    received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    decode_errors: AtomicU64,
    stale_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    pub decode_errors: u64,
    pub stale_dropped: u64,
}

impl ChannelStats {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_stale(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
        }
    }
}

// ── Remote gaze ───────────────────────────────────────────────────────────────

/// How fresh the other peer's gaze looks. Display quality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkQuality {
    Connected,
    Delayed,
    NoSignal,
}

/// The last remote sample together with its age at the time of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteGaze {
    pub sample: GazeSample,
    /// `now - sample.timestamp`, clamped at zero. Mixes two unsynchronised
    /// clocks, so it is only as good as the stations' time sync.
    pub age: Duration,
}

impl RemoteGaze {
    pub fn quality(&self, stale_after: Duration) -> LinkQuality {
        if self.age <= stale_after {
            LinkQuality::Connected
        } else {
            LinkQuality::Delayed
        }
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

pub struct SessionContext {
    role: PeerRole,
    sharing: AtomicBool,
    gaze_trial: AtomicU64,
    remote_gaze: DashMap<PeerRole, GazeSample>,
    stale_after: Duration,
    pub control_stats: ChannelStats,
    pub gaze_stats: ChannelStats,
}

impl SessionContext {
    pub fn new(role: PeerRole, stale_after: Duration) -> Self {
        Self {
            role,
            sharing: AtomicBool::new(false),
            gaze_trial: AtomicU64::new(NO_TRIAL),
            remote_gaze: DashMap::new(),
            stale_after,
            control_stats: ChannelStats::default(),
            gaze_stats: ChannelStats::default(),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn sharing(&self) -> bool {
        self.sharing.load(Ordering::Acquire)
    }

    pub fn set_sharing(&self, active: bool) {
        let was = self.sharing.swap(active, Ordering::AcqRel);
        if was != active {
            tracing::debug!(active, "gaze sharing toggled");
        }
    }

    /// Trial number stamped on outgoing gaze samples.
    pub fn gaze_trial(&self) -> Option<u32> {
        match self.gaze_trial.load(Ordering::Acquire) {
            NO_TRIAL => None,
            n => Some(n as u32),
        }
    }

    pub fn set_gaze_trial(&self, trial: Option<u32>) {
        let raw = trial.map(u64::from).unwrap_or(NO_TRIAL);
        self.gaze_trial.store(raw, Ordering::Release);
    }

    /// Offer a received sample. Returns false if it was not newer than the
    /// last accepted sample from the same origin and was discarded.
    pub fn accept_remote(&self, sample: GazeSample) -> bool {
        match self.remote_gaze.entry(sample.origin) {
            Entry::Occupied(mut e) => {
                let last = e.get().seq;
                let newer = sample.seq > last;
                let restarted = last.saturating_sub(sample.seq) > SEQ_RESTART_WINDOW;
                if newer || restarted {
                    e.insert(sample);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(sample);
                true
            }
        }
    }

    /// Latest sample from the other peer, with its age.
    pub fn last_remote_sample(&self) -> Option<RemoteGaze> {
        let sample = self.remote_gaze.get(&self.role.other())?.value().clone();
        // A peer clock far enough off overflows Duration; that is just old.
        let age = (now_secs() - sample.timestamp).max(0.0);
        Some(RemoteGaze {
            sample,
            age: Duration::try_from_secs_f64(age).unwrap_or(Duration::MAX),
        })
    }

    pub fn link_quality(&self) -> LinkQuality {
        self.last_remote_sample()
            .map(|g| g.quality(self.stale_after))
            .unwrap_or(LinkQuality::NoSignal)
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

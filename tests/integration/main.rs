//! Dyad integration test harness.
//!
//! Every test runs both sides (or one real side and a raw-socket fake) over
//! 127.0.0.1 inside one process. Ports are picked fresh per test, so tests
//! can run in parallel and need no special privileges.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;

use dyad_core::config::{DyadConfig, GazeSourceKind};
use dyad_core::trial::TrialLog;
use dyad_core::wire::{Category, Envelope, PeerRole};
use dyad_services::{
    Frame, GazeSource, LocalInput, PeerLink, RawGaze, Renderer, ResponseInput, SessionReport,
    StageState, Station, TrialSink,
};

mod session;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A port nothing is bound to right now.
pub fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("ephemeral bind")
}

pub fn local(port: u16) -> SocketAddr {
    SocketAddr::new(LOCALHOST, port)
}

/// Timings short enough for a multi-trial session to finish in a few
/// seconds.
pub fn fast_config(role: PeerRole) -> DyadConfig {
    let mut config = DyadConfig::default();
    config.session.role = role;
    config.session.total_trials = 2;
    config.session.base_seed = Some(42);
    config.session.gaze_source = GazeSourceKind::None;
    config.network.local_addr = LOCALHOST;
    config.network.remote_addr = LOCALHOST;
    config.network.socket_buffer_bytes = 0;

    let t = &mut config.timing;
    t.session_start_timeout_ms = 3_000;
    t.stage_timeout_ms = 3_000;
    t.ack_timeout_ms = 1_000;
    t.grid_display_ms = 150;
    t.response_timeout_ms = 600;
    t.feedback_ms = 80;
    t.frame_interval_ms = 5;
    t.recv_timeout_ms = 5;
    t.retry_backoff_ms = 10;
    t.close_join_ms = 200;
    config
}

/// Two configs pointed at each other on fresh ports.
pub fn config_pair(trials: u32) -> (DyadConfig, DyadConfig) {
    let (a_ctl, b_ctl, a_gaze, b_gaze) = (free_port(), free_port(), free_port(), free_port());
    let mut a = fast_config(PeerRole::Initiator);
    let mut b = fast_config(PeerRole::Follower);
    for (cfg, own_ctl, peer_ctl, own_gaze, peer_gaze) in [
        (&mut a, a_ctl, b_ctl, a_gaze, b_gaze),
        (&mut b, b_ctl, a_ctl, b_gaze, a_gaze),
    ] {
        cfg.session.total_trials = trials;
        cfg.network.control_port = own_ctl;
        cfg.network.control_remote_port = peer_ctl;
        cfg.network.gaze_listen_port = own_gaze;
        cfg.network.gaze_remote_port = peer_gaze;
    }
    (a, b)
}

/// Config for one real peer whose counterpart is a fake at `peer_control`
/// and `peer_gaze`.
pub fn config_against(role: PeerRole, peer_control: u16, peer_gaze: u16) -> DyadConfig {
    let mut cfg = fast_config(role);
    cfg.network.control_port = free_port();
    cfg.network.control_remote_port = peer_control;
    cfg.network.gaze_listen_port = free_port();
    cfg.network.gaze_remote_port = peer_gaze;
    cfg
}

/// What the renderer last showed, shared with the scripted input.
#[derive(Debug, Clone, Default)]
pub struct Screen {
    pub stage: Option<StageState>,
    pub trial: Option<u32>,
    /// (stage, trial, sharing) each time any of them changed.
    pub history: Vec<(StageState, Option<u32>, bool)>,
    pub signals: Vec<u32>,
}

pub type SharedScreen = Arc<Mutex<Screen>>;

pub struct RecordingRenderer {
    screen: SharedScreen,
}

impl Renderer for RecordingRenderer {
    fn draw(&mut self, frame: &Frame<'_>) {
        let mut s = self.screen.lock().unwrap();
        s.stage = Some(frame.stage);
        s.trial = frame.trial;
        let entry = (frame.stage, frame.trial, frame.sharing);
        if s.history.last() != Some(&entry) {
            s.history.push(entry);
        }
        if frame.feedback_signal {
            if let Some(t) = frame.trial {
                if s.signals.last() != Some(&t) {
                    s.signals.push(t);
                }
            }
        }
    }
}

/// Answers every trial with `answer` once the response stage has been on
/// screen for `delay`. `None` never answers. An `abort_in` trial triggers an
/// operator abort instead.
pub struct ScriptedInput {
    screen: SharedScreen,
    answer: Option<Category>,
    delay: Duration,
    abort_in: Option<u32>,
    answered: Vec<u32>,
    shown: Option<(u32, std::time::Instant)>,
}

impl ResponseInput for ScriptedInput {
    fn poll_input(&mut self) -> Option<LocalInput> {
        let (stage, trial) = {
            let s = self.screen.lock().unwrap();
            (s.stage, s.trial)
        };
        let trial = trial?;
        if stage == Some(StageState::GridDisplay) && self.abort_in == Some(trial) {
            return Some(LocalInput::Abort);
        }
        if stage != Some(StageState::ResponseCollection) || self.answered.contains(&trial) {
            return None;
        }
        let shown = match self.shown {
            Some((t, at)) if t == trial => at,
            _ => {
                let now = std::time::Instant::now();
                self.shown = Some((trial, now));
                now
            }
        };
        if shown.elapsed() < self.delay {
            return None;
        }
        self.answered.push(trial);
        self.answer.map(LocalInput::Respond)
    }
}

/// Fixed gaze position every frame.
pub struct SteadyGaze;

impl GazeSource for SteadyGaze {
    fn poll_sample(&mut self) -> Option<RawGaze> {
        Some(RawGaze {
            x: 10.0,
            y: -20.0,
            valid: true,
        })
    }
}

#[derive(Clone, Default)]
pub struct MemorySink {
    pub logs: Arc<Mutex<Vec<TrialLog>>>,
}

impl TrialSink for MemorySink {
    fn persist(&mut self, logs: &[TrialLog]) -> anyhow::Result<()> {
        self.logs.lock().unwrap().extend_from_slice(logs);
        Ok(())
    }
}

/// A station plus handles to what it saw.
pub struct TestStation {
    pub screen: SharedScreen,
    pub sink: MemorySink,
    station: Option<Station>,
}

impl TestStation {
    pub fn new(answer: Option<Category>) -> Self {
        Self::build(answer, Duration::ZERO, None)
    }

    /// Answers `answer`, but only `delay` after the response stage appears.
    pub fn answering_after(answer: Category, delay: Duration) -> Self {
        Self::build(Some(answer), delay, None)
    }

    pub fn aborting_in(trial: u32) -> Self {
        Self::build(None, Duration::ZERO, Some(trial))
    }

    fn build(answer: Option<Category>, delay: Duration, abort_in: Option<u32>) -> Self {
        let screen = SharedScreen::default();
        let sink = MemorySink::default();
        let station = Station {
            gaze: Box::new(SteadyGaze),
            input: Box::new(ScriptedInput {
                screen: screen.clone(),
                answer,
                delay,
                abort_in,
                answered: Vec::new(),
                shown: None,
            }),
            renderer: Box::new(RecordingRenderer {
                screen: screen.clone(),
            }),
            sink: Box::new(sink.clone()),
        };
        Self {
            screen,
            sink,
            station: Some(station),
        }
    }

    pub fn take(&mut self) -> Station {
        self.station.take().expect("station already taken")
    }
}

/// Run one peer to completion and close its channels.
pub async fn run_peer(config: DyadConfig, mut station: TestStation) -> Result<(SessionReport, TestStation)> {
    let link = PeerLink::bind(&config).context("bind")?;
    let (abort_tx, abort_rx) = tokio::sync::broadcast::channel(1);
    let report = link.coordinator(&config, station.take(), abort_rx).run().await;
    drop(abort_tx);
    link.close().await;
    Ok((report, station))
}

/// Run initiator and follower against each other.
pub async fn run_pair(
    a: DyadConfig,
    a_station: TestStation,
    b: DyadConfig,
    b_station: TestStation,
) -> Result<((SessionReport, TestStation), (SessionReport, TestStation))> {
    let follower = tokio::spawn(run_peer(b, b_station));
    // Let the follower bind first so the first start_experiment is not lost.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let initiator = tokio::spawn(run_peer(a, a_station));
    let a = initiator.await??;
    let b = follower.await??;
    Ok((a, b))
}

/// A raw UDP socket standing in for the other station.
pub struct FakePeer {
    pub socket: UdpSocket,
}

impl FakePeer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.expect("fake peer bind"),
        }
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    pub async fn send(&self, to: SocketAddr, body: dyad_core::wire::ControlMessage) {
        let bytes = Envelope::now(body).encode().unwrap();
        self.socket.send_to(&bytes, to).await.unwrap();
    }

    /// Next datagram within `timeout`.
    pub async fn recv_raw(&self, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                buf.truncate(n);
                Some((buf, from))
            }
            _ => None,
        }
    }

    /// Next decodable control envelope within `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Option<(Envelope, SocketAddr)> {
        let (bytes, from) = self.recv_raw(timeout).await?;
        Envelope::decode(&bytes).ok().map(|e| (e, from))
    }

    /// Everything that arrives until the line has been quiet for `idle`.
    pub async fn drain(&self, idle: Duration) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some((env, _)) = self.recv(idle).await {
            out.push(env);
        }
        out
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    if check() {
        return Ok(());
    }
    bail!("condition not met within {timeout:?}")
}

/// Kinds of a sequence of envelopes, for readable assertions.
pub fn kinds(envs: &[Envelope]) -> VecDeque<&'static str> {
    envs.iter().map(|e| e.body.kind().as_str()).collect()
}

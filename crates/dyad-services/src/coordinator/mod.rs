//! Stage coordinator — drives one peer through a session.
//!
//! The foreground loop lives here: it is the only place the stage state is
//! mutated. Each frame it checks for an abort or a peer `end_experiment`,
//! forwards a local gaze sample, polls the response input and draws. The
//! initiator and follower drivers build their flows out of these pieces.

mod follower;
mod initiator;
pub mod race;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use dyad_core::config::{DyadConfig, SessionConfig, TimingConfig};
use dyad_core::trial::{SpatialLayout, TrialLog, TrialLogBook};
use dyad_core::wire::{
    now_secs, Category, ControlMessage, Feedback, MessageKind, PeerRole, ResponseRecord,
    ResponseUpdate, Stage, SyncAck, TrialParameters,
};

use crate::control::ControlChannel;
use crate::error::SessionError;
use crate::gaze::GazeChannel;
use crate::inbox::Message;
use crate::session::{LinkQuality, RemoteGaze, SessionContext};

pub use race::{RaceEvent, ResponseRace};

// ── Stage state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    AwaitStart,
    GridDisplay,
    ResponseCollection,
    Feedback,
    Ended,
}

impl StageState {
    /// Allowed transitions. Anything may end; nothing leaves `Ended`.
    pub fn can_advance_to(self, next: StageState) -> bool {
        use StageState::*;
        if self == Ended {
            return false;
        }
        matches!(
            (self, next),
            (_, Ended)
                | (AwaitStart, GridDisplay)
                | (GridDisplay, ResponseCollection)
                | (ResponseCollection, Feedback)
                | (Feedback, GridDisplay)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageState::AwaitStart => "await_start",
            StageState::GridDisplay => "grid_display",
            StageState::ResponseCollection => "response_collection",
            StageState::Feedback => "feedback",
            StageState::Ended => "ended",
        }
    }
}

// ── Collaborators ─────────────────────────────────────────────────────────────

/// One reading from the local tracker. `valid = false` is a normal reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawGaze {
    pub x: f64,
    pub y: f64,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalInput {
    Respond(Category),
    /// Operator cancelled the session.
    Abort,
}

/// Local eye tracker, polled once per frame.
pub trait GazeSource: Send {
    fn poll_sample(&mut self) -> Option<RawGaze>;
}

/// Keyboard or button box, polled once per frame.
pub trait ResponseInput: Send {
    fn poll_input(&mut self) -> Option<LocalInput>;
}

pub trait Renderer: Send {
    fn draw(&mut self, frame: &Frame<'_>);
}

/// Receives the completed trials once the session is over.
pub trait TrialSink: Send {
    fn persist(&mut self, logs: &[TrialLog]) -> anyhow::Result<()>;
}

/// Everything the renderer needs for one frame.
#[derive(Debug)]
pub struct Frame<'a> {
    pub role: PeerRole,
    pub stage: StageState,
    pub trial: Option<u32>,
    /// Time left in the current timed display, zero while waiting on the peer.
    pub remaining: Duration,
    pub params: Option<&'a TrialParameters>,
    pub layout: Option<&'a SpatialLayout>,
    pub local_gaze: Option<RawGaze>,
    pub remote_gaze: Option<RemoteGaze>,
    pub link: LinkQuality,
    pub sharing: bool,
    /// Someone has answered this trial, as seen locally.
    pub feedback_signal: bool,
    pub feedback: Option<&'a Feedback>,
    pub total_score: u32,
}

pub struct Station {
    pub gaze: Box<dyn GazeSource>,
    pub input: Box<dyn ResponseInput>,
    pub renderer: Box<dyn Renderer>,
    pub sink: Box<dyn TrialSink>,
}

// ── Outcome ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed,
    PeerEnded { reason: Option<String> },
    Aborted,
    Desynchronized {
        waiting_for: MessageKind,
        after: Duration,
    },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub role: PeerRole,
    pub outcome: SessionOutcome,
    pub logs: Vec<TrialLog>,
    pub total_score: u32,
    pub trials_planned: u32,
    /// The trial sink accepted the logs.
    pub persisted: bool,
}

impl SessionReport {
    pub fn accuracy_percent(&self) -> f64 {
        if self.trials_planned == 0 {
            return 0.0;
        }
        f64::from(self.total_score) / f64::from(self.trials_planned) * 100.0
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// State of the trial in progress.
struct TrialView {
    params: TrialParameters,
    layout: SpatialLayout,
    race: ResponseRace,
    feedback: Option<Feedback>,
}

/// A local key press waiting for the race loop.
struct PendingResponse {
    category: Category,
    reaction_time: f64,
    /// Wall-clock time of the press, comparable with message receipt times.
    observed_at: f64,
}

pub struct StageCoordinator {
    ctx: Arc<SessionContext>,
    control: Arc<ControlChannel>,
    gaze: Arc<GazeChannel>,
    session: SessionConfig,
    timing: TimingConfig,
    station: Station,
    abort: broadcast::Receiver<()>,
    state: StageState,
    stage_started: Instant,
    stage_deadline: Option<Instant>,
    current: Option<TrialView>,
    /// Local answer given before the race loop picked it up.
    pending: Option<PendingResponse>,
    local_gaze: Option<RawGaze>,
    book: TrialLogBook,
    total_score: u32,
    trials_planned: u32,
}

impl StageCoordinator {
    pub fn new(
        ctx: Arc<SessionContext>,
        control: Arc<ControlChannel>,
        gaze: Arc<GazeChannel>,
        config: &DyadConfig,
        station: Station,
        abort: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            ctx,
            control,
            gaze,
            session: config.session.clone(),
            timing: config.timing.clone(),
            station,
            abort,
            state: StageState::AwaitStart,
            stage_started: Instant::now(),
            stage_deadline: None,
            current: None,
            pending: None,
            local_gaze: None,
            book: TrialLogBook::new(),
            total_score: 0,
            trials_planned: 0,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Run the session to its end and hand the trial logs to the sink.
    ///
    /// Never fails: every way out of the session produces a report with
    /// whatever trials were completed.
    pub async fn run(mut self) -> SessionReport {
        let role = self.ctx.role();
        tracing::info!(%role, "session starting");

        let result = match role {
            PeerRole::Initiator => self.run_initiator().await,
            PeerRole::Follower => self.run_follower().await,
        };
        self.gaze.set_sharing(false);
        self.gaze.set_trial(None);

        let outcome = self.conclude(result).await;
        if self.state != StageState::Ended {
            self.enter(StageState::Ended);
        }
        self.draw();

        let persisted = match self.station.sink.persist(self.book.entries()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, trials = self.book.len(), "failed to persist trial logs");
                false
            }
        };

        let report = SessionReport {
            role,
            outcome,
            total_score: self.book.total_score(),
            trials_planned: self.trials_planned,
            logs: self.book.into_entries(),
            persisted,
        };
        tracing::info!(
            %role,
            outcome = ?report.outcome,
            score = report.total_score,
            trials = report.trials_planned,
            accuracy = %format!("{:.1}%", report.accuracy_percent()),
            "session finished"
        );
        report
    }

    async fn conclude(&mut self, result: Result<(), SessionError>) -> SessionOutcome {
        match result {
            Ok(()) => SessionOutcome::Completed,
            Err(SessionError::PeerEnded { reason }) => {
                let all_logged = self.trials_planned > 0
                    && self.book.len() as u32 >= self.trials_planned;
                if self.ctx.role() == PeerRole::Follower && all_logged {
                    SessionOutcome::Completed
                } else {
                    tracing::warn!(?reason, "peer ended the session early");
                    SessionOutcome::PeerEnded { reason }
                }
            }
            Err(SessionError::Aborted) => {
                tracing::warn!("session aborted by operator");
                notify_end(&self.control, "aborted").await;
                SessionOutcome::Aborted
            }
            Err(SessionError::HandshakeTimeout { waiting_for, after }) => {
                tracing::error!(%waiting_for, ?after, stage = self.state.as_str(), "peer stopped answering");
                notify_end(&self.control, "desynchronized").await;
                SessionOutcome::Desynchronized { waiting_for, after }
            }
            Err(e) => {
                tracing::error!(error = %e, "session failed");
                notify_end(&self.control, "error").await;
                SessionOutcome::Failed(e.to_string())
            }
        }
    }

    // ── Stage bookkeeping ─────────────────────────────────────────────────────

    fn enter(&mut self, next: StageState) {
        if !self.state.can_advance_to(next) {
            tracing::warn!(from = self.state.as_str(), to = next.as_str(), "unexpected stage transition");
        }
        tracing::info!(stage = next.as_str(), trial = ?self.current_trial(), "stage");
        self.state = next;
        self.stage_started = Instant::now();
        self.stage_deadline = None;
    }

    fn current_trial(&self) -> Option<u32> {
        self.current.as_ref().map(|t| t.params.trial_number)
    }

    /// Fix the trial's parameters, then start tagging gaze with its number.
    fn begin_trial(&mut self, params: TrialParameters) {
        let screen = (self.session.screen_width, self.session.screen_height);
        let layout = SpatialLayout::compute(&params, screen);
        let trial = params.trial_number;
        self.current = Some(TrialView {
            params,
            layout,
            race: ResponseRace::new(self.ctx.role()),
            feedback: None,
        });
        self.pending = None;
        self.gaze.set_trial(Some(trial));
    }

    /// Record the trial under the authoritative feedback values.
    fn finish_trial(&mut self, feedback: &Feedback) {
        let Some(view) = self.current.as_mut() else {
            return;
        };
        view.feedback = Some(feedback.clone());
        let log = TrialLog::new(
            &view.params,
            view.layout.clone(),
            view.race.local().cloned(),
            view.race.remote().cloned(),
            feedback,
        );
        if self.book.append(log) {
            tracing::info!(
                trial = feedback.trial_number,
                first_responder = ?feedback.first_responder,
                trial_score = feedback.trial_score,
                total_score = feedback.total_score,
                "trial complete"
            );
        } else {
            tracing::warn!(trial = feedback.trial_number, "trial already logged, ignoring");
        }
    }

    // ── Frame loop ────────────────────────────────────────────────────────────

    fn frames(&self) -> Interval {
        let mut frames = tokio::time::interval(self.timing.frame_interval());
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        frames
    }

    /// One foreground frame.
    fn tick(&mut self) -> Result<(), SessionError> {
        self.check_interrupts()?;

        // Pings are answered by the receive loop; nothing else wants them.
        while let Some(msg) = self
            .control
            .take(MessageKind::Ping)
            .or_else(|| self.control.take(MessageKind::Pong))
        {
            tracing::trace!(kind = %msg.kind(), "heartbeat consumed");
        }

        if let Some(raw) = self.station.gaze.poll_sample() {
            self.local_gaze = Some(raw);
            self.gaze.submit_sample(raw.x, raw.y, raw.valid);
        }

        match self.station.input.poll_input() {
            Some(LocalInput::Abort) => return Err(SessionError::Aborted),
            Some(LocalInput::Respond(category)) => self.queue_response(category),
            None => {}
        }

        self.draw();
        Ok(())
    }

    fn check_interrupts(&mut self) -> Result<(), SessionError> {
        match self.abort.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) => return Err(SessionError::Aborted),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
        }
        if let Some(msg) = self.control.take(MessageKind::EndExperiment) {
            return Err(peer_ended(msg));
        }
        Ok(())
    }

    fn queue_response(&mut self, category: Category) {
        let answered = self
            .current
            .as_ref()
            .map(|t| t.race.has_local())
            .unwrap_or(true);
        if self.state != StageState::ResponseCollection || answered || self.pending.is_some() {
            tracing::trace!(%category, stage = self.state.as_str(), "response key discarded");
            return;
        }
        self.pending = Some(PendingResponse {
            category,
            reaction_time: self.stage_started.elapsed().as_secs_f64(),
            observed_at: now_secs(),
        });
    }

    fn draw(&mut self) {
        let remaining = self
            .stage_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        let remote_gaze = self.ctx.last_remote_sample();
        let link = remote_gaze
            .as_ref()
            .map(|g| g.quality(self.ctx.stale_after()))
            .unwrap_or(LinkQuality::NoSignal);
        let view = self.current.as_ref();

        let frame = Frame {
            role: self.ctx.role(),
            stage: self.state,
            trial: view.map(|t| t.params.trial_number),
            remaining,
            params: view.map(|t| &t.params),
            layout: view.map(|t| &t.layout),
            local_gaze: self.local_gaze,
            remote_gaze,
            link,
            sharing: self.ctx.sharing(),
            feedback_signal: view.is_some_and(|t| t.race.first().is_some()),
            feedback: view.and_then(|t| t.feedback.as_ref()),
            total_score: self.total_score,
        };
        self.station.renderer.draw(&frame);
    }

    /// Keep rendering for `duration`.
    async fn show_for(&mut self, duration: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + duration;
        self.stage_deadline = Some(deadline);
        let mut frames = self.frames();
        loop {
            frames.tick().await;
            if Instant::now() >= deadline {
                return Ok(());
            }
            self.tick()?;
        }
    }

    // ── Waiting on the peer ───────────────────────────────────────────────────

    /// Wait for a message of `kind`, rendering while waiting.
    async fn await_message(
        &mut self,
        kind: MessageKind,
        timeout: Duration,
    ) -> Result<Message, SessionError> {
        self.await_with(Some(kind), kind, timeout).await
    }

    /// Wait for the next message of any kind. `expecting` only names the
    /// timeout.
    async fn await_next(
        &mut self,
        expecting: MessageKind,
        timeout: Duration,
    ) -> Result<Message, SessionError> {
        self.await_with(None, expecting, timeout).await
    }

    async fn await_with(
        &mut self,
        filter: Option<MessageKind>,
        waiting_for: MessageKind,
        timeout: Duration,
    ) -> Result<Message, SessionError> {
        let deadline = Instant::now() + timeout;
        let slice = self.timing.frame_interval();
        let control = self.control.clone();
        loop {
            self.tick()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::HandshakeTimeout {
                    waiting_for,
                    after: timeout,
                });
            }
            let wait = slice.min(deadline - now);
            let got = match filter {
                Some(kind) => control.wait_for(kind, wait).await,
                None => control.poll(wait).await,
            };
            if let Some(msg) = got {
                return Ok(msg);
            }
        }
    }

    /// Wait for the ack of `stage` for `trial`, discarding acks of anything
    /// else.
    async fn await_sync_ack(&mut self, stage: Stage, trial: u32) -> Result<(), SessionError> {
        let timeout = self.timing.ack_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let msg = self
                .await_message(MessageKind::StageSyncAck, left)
                .await
                .map_err(|e| match e {
                    SessionError::HandshakeTimeout { waiting_for, .. } => {
                        SessionError::HandshakeTimeout {
                            waiting_for,
                            after: timeout,
                        }
                    }
                    other => other,
                })?;
            match msg.body {
                ControlMessage::StageSyncAck(ack) if ack.stage == stage && ack.trial_number == trial => {
                    if !ack.ready {
                        tracing::warn!(?stage, trial, "peer acked stage but is not ready");
                    }
                    return Ok(());
                }
                other => {
                    tracing::warn!(?other, ?stage, trial, "discarding stale stage_sync_ack");
                }
            }
        }
    }

    // ── Response race ─────────────────────────────────────────────────────────

    /// Collect answers for the current trial until both peers have answered,
    /// a message in `stop_on` is queued, or `deadline` passes.
    async fn collect_responses(
        &mut self,
        deadline: Instant,
        stop_on: &[MessageKind],
    ) -> Result<(), SessionError> {
        let Some(trial) = self.current_trial() else {
            return Ok(());
        };
        let control = self.control.clone();
        let mut frames = self.frames();
        self.stage_deadline = Some(deadline);

        loop {
            if let Some(local) = self.pending.take() {
                // Remote answers received before the key press settle first.
                let mut later = Vec::new();
                while let Some(msg) = control.take(MessageKind::ResponseUpdate) {
                    if msg.receipt_time <= local.observed_at {
                        self.observe_update(trial, msg);
                    } else {
                        later.push(msg);
                    }
                }
                self.respond_locally(trial, local.category, local.reaction_time)
                    .await?;
                for msg in later {
                    self.observe_update(trial, msg);
                }
            }
            if self.current.as_ref().is_some_and(|t| t.race.complete()) {
                return Ok(());
            }
            if stop_on.iter().any(|kind| control.has(*kind)) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::info!(trial, "response window closed");
                return Ok(());
            }

            tokio::select! {
                _ = frames.tick() => self.tick()?,
                msg = control.wait_for(MessageKind::ResponseUpdate, deadline - now) => {
                    if let Some(msg) = msg {
                        self.observe_update(trial, msg);
                    }
                }
            }
        }
    }

    async fn respond_locally(
        &mut self,
        trial: u32,
        response: Category,
        reaction_time: f64,
    ) -> Result<(), SessionError> {
        let Some(view) = self.current.as_mut() else {
            return Ok(());
        };
        let event = view.race.observe_local(response, reaction_time);
        if event == RaceEvent::Duplicate {
            return Ok(());
        }
        if event == RaceEvent::First {
            tracing::info!(trial, %response, reaction_time, "first response (local)");
        } else {
            tracing::debug!(trial, %response, reaction_time, "local response");
        }

        let record = ResponseRecord {
            responder: self.ctx.role(),
            response,
            reaction_time,
        };
        self.control
            .post(ControlMessage::ResponseUpdate(ResponseUpdate::new(trial, &record)))
            .await?;
        Ok(())
    }

    fn observe_update(&mut self, trial: u32, msg: Message) {
        let ControlMessage::ResponseUpdate(update) = msg.body else {
            return;
        };
        if update.trial_number != trial {
            tracing::warn!(trial, got = update.trial_number, "response_update for another trial");
            return;
        }
        let Some(view) = self.current.as_mut() else {
            return;
        };
        let responder = update.responder;
        let response = update.response;
        match view.race.observe_remote(update.record()) {
            RaceEvent::First => {
                tracing::info!(trial, %responder, %response, "first response (remote)")
            }
            RaceEvent::Later => tracing::debug!(trial, %responder, %response, "remote response"),
            RaceEvent::Duplicate => tracing::debug!(trial, %responder, "duplicate response_update"),
            RaceEvent::Foreign => {
                tracing::warn!(trial, %responder, "response_update from unexpected responder")
            }
        }
    }
}

/// Single best-effort `end_experiment`.
async fn notify_end(control: &ControlChannel, reason: &str) {
    if let Err(e) = control.send(ControlMessage::end(reason), 1).await {
        tracing::warn!(error = %e, "could not notify peer of session end");
    }
}

async fn sync_ack(control: &ControlChannel, stage: Stage, trial_number: u32) -> Result<(), SessionError> {
    let ack = SyncAck {
        ready: true,
        stage,
        trial_number,
    };
    control.post(ControlMessage::StageSyncAck(ack)).await?;
    Ok(())
}

fn peer_ended(msg: Message) -> SessionError {
    let reason = match msg.body {
        ControlMessage::EndExperiment(end) => end.reason,
        _ => None,
    };
    SessionError::PeerEnded { reason }
}

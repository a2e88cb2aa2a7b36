//! Follower driver: mirrors the initiator from the messages it sends.
//!
//! Stage transitions come only from the control channel. Messages that do
//! not fit the current stage (duplicates, stragglers from an earlier trial)
//! are dropped with a warning.

use tokio::time::Instant;

use dyad_core::wire::{ControlMessage, Feedback, MessageKind, StartAck, Stage, TrialParameters};

use super::{sync_ack, StageCoordinator, StageState};
use crate::control::ControlChannel;
use crate::error::SessionError;

impl StageCoordinator {
    pub(super) async fn run_follower(&mut self) -> Result<(), SessionError> {
        let timeout = self.timing.session_start_timeout();
        tracing::info!(?timeout, "waiting for initiator");
        let start = self
            .await_message(MessageKind::StartExperiment, timeout)
            .await?;
        if let ControlMessage::StartExperiment(s) = start.body {
            self.trials_planned = s.total_trials;
        }
        ack_start(&self.control).await?;
        tracing::info!(trials = self.trials_planned, "session started");

        let stage_timeout = self.timing.stage_timeout();
        loop {
            let expecting = self.expected_next();
            let msg = self.await_next(expecting, stage_timeout).await?;
            match msg.body {
                ControlMessage::StartExperiment(_) if self.state == StageState::AwaitStart => {
                    // Our ack was lost; the initiator is repeating itself.
                    ack_start(&self.control).await?;
                }
                ControlMessage::StageGridDisplay(params) => self.on_grid_display(params).await?,
                ControlMessage::StageResponse(stage) => {
                    self.on_response_stage(stage.trial_number).await?
                }
                ControlMessage::StageFeedback(feedback) => self.on_feedback(feedback).await?,
                ControlMessage::EndExperiment(end) => {
                    return Err(SessionError::PeerEnded { reason: end.reason });
                }
                other => {
                    tracing::debug!(kind = %other.kind(), stage = self.state.as_str(), "ignoring message");
                }
            }
        }
    }

    /// What the initiator should send next, for timeout reporting.
    fn expected_next(&self) -> MessageKind {
        match self.state {
            StageState::AwaitStart => MessageKind::StageGridDisplay,
            StageState::GridDisplay => MessageKind::StageResponse,
            StageState::ResponseCollection => MessageKind::StageFeedback,
            StageState::Feedback if (self.book.len() as u32) < self.trials_planned => {
                MessageKind::StageGridDisplay
            }
            StageState::Feedback | StageState::Ended => MessageKind::EndExperiment,
        }
    }

    async fn on_grid_display(&mut self, params: TrialParameters) -> Result<(), SessionError> {
        let n = params.trial_number;
        let stale = self.current_trial().is_some_and(|current| n <= current);
        if stale || !self.state.can_advance_to(StageState::GridDisplay) {
            tracing::warn!(trial = n, stage = self.state.as_str(), "ignoring out-of-order stage_grid_display");
            return Ok(());
        }
        tracing::info!(
            trial = n,
            seed = params.seed,
            target_position = params.target_position,
            "trial"
        );

        self.begin_trial(params);
        self.enter(StageState::GridDisplay);
        self.gaze.set_sharing(true);
        sync_ack(&self.control, Stage::GridDisplay, n).await?;
        let display = self.timing.grid_display();
        self.show_for(display).await?;
        self.gaze.set_sharing(false);
        Ok(())
    }

    async fn on_response_stage(&mut self, trial: u32) -> Result<(), SessionError> {
        if self.state != StageState::GridDisplay || self.current_trial() != Some(trial) {
            tracing::warn!(trial, stage = self.state.as_str(), "ignoring out-of-order stage_response");
            return Ok(());
        }
        self.enter(StageState::ResponseCollection);
        sync_ack(&self.control, Stage::ResponseCollection, trial).await?;

        // Answers stay open until the initiator moves on.
        let deadline = Instant::now() + self.timing.response_timeout() + self.timing.stage_timeout();
        self.collect_responses(
            deadline,
            &[MessageKind::StageFeedback, MessageKind::EndExperiment],
        )
        .await
    }

    async fn on_feedback(&mut self, feedback: Feedback) -> Result<(), SessionError> {
        let n = feedback.trial_number;
        if self.state != StageState::ResponseCollection || self.current_trial() != Some(n) {
            tracing::warn!(trial = n, stage = self.state.as_str(), "ignoring out-of-order stage_feedback");
            return Ok(());
        }

        if let Some(view) = self.current.as_ref() {
            let local_first = view.race.first().map(|r| r.responder);
            if local_first != feedback.first_responder {
                tracing::info!(
                    trial = n,
                    local = ?local_first,
                    authoritative = ?feedback.first_responder,
                    "local first-responder view overridden by initiator"
                );
            }
        }

        self.total_score = feedback.total_score;
        self.enter(StageState::Feedback);
        self.finish_trial(&feedback);
        sync_ack(&self.control, Stage::Feedback, n).await?;
        self.gaze.set_sharing(true);
        let display = self.timing.feedback();
        self.show_for(display).await?;
        self.gaze.set_sharing(false);
        Ok(())
    }
}

async fn ack_start(control: &ControlChannel) -> Result<(), SessionError> {
    control
        .post(ControlMessage::AckStart(StartAck { client_ready: true }))
        .await?;
    Ok(())
}

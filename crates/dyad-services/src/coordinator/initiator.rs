//! Initiator driver: owns trial parameters, seeds and scoring.

use tokio::time::Instant;

use dyad_core::trial::score;
use dyad_core::wire::{
    ControlMessage, Feedback, MessageKind, ResponseStage, SessionStart, Stage, TrialParameters,
};

use super::{StageCoordinator, StageState};
use crate::error::SessionError;

impl StageCoordinator {
    pub(super) async fn run_initiator(&mut self) -> Result<(), SessionError> {
        let total = self.session.total_trials;
        self.trials_planned = total;
        self.open_session(total).await?;

        let base_seed = self.session.base_seed.unwrap_or_else(rand::random);
        tracing::info!(total, base_seed, "session started");

        for n in 1..=total {
            let seed = base_seed.wrapping_add(u64::from(n));
            let params = TrialParameters::generate(n, seed, &self.session.conditions)?;
            self.run_trial(params).await?;
        }

        self.control.post(ControlMessage::end("complete")).await?;
        Ok(())
    }

    /// Announce the session, repeating `start_experiment` every ack timeout
    /// until the follower answers or the start timeout runs out.
    async fn open_session(&mut self, total_trials: u32) -> Result<(), SessionError> {
        let timeout = self.timing.session_start_timeout();
        let resend = self.timing.ack_timeout();
        let deadline = Instant::now() + timeout;
        tracing::info!(?timeout, "waiting for follower");

        loop {
            self.control
                .post(ControlMessage::StartExperiment(SessionStart { total_trials }))
                .await?;
            let wait = resend.min(deadline.saturating_duration_since(Instant::now()));
            match self.await_message(MessageKind::AckStart, wait).await {
                Ok(msg) => {
                    if let ControlMessage::AckStart(ack) = msg.body {
                        if !ack.client_ready {
                            tracing::warn!("follower acknowledged start but is not ready");
                        }
                    }
                    return Ok(());
                }
                Err(SessionError::HandshakeTimeout { .. }) if Instant::now() < deadline => {
                    tracing::debug!("start_experiment unanswered, resending");
                }
                Err(SessionError::HandshakeTimeout { waiting_for, .. }) => {
                    return Err(SessionError::HandshakeTimeout {
                        waiting_for,
                        after: timeout,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_trial(&mut self, params: TrialParameters) -> Result<(), SessionError> {
        let n = params.trial_number;
        let target = params.target_category;
        tracing::info!(
            trial = n,
            seed = params.seed,
            target_position = params.target_position,
            %target,
            "trial"
        );

        // Grid display
        self.begin_trial(params.clone());
        self.enter(StageState::GridDisplay);
        self.control
            .post(ControlMessage::StageGridDisplay(params))
            .await?;
        self.gaze.set_sharing(true);
        self.await_sync_ack(Stage::GridDisplay, n).await?;
        let display = self.timing.grid_display();
        self.show_for(display).await?;
        self.gaze.set_sharing(false);

        // Response collection
        self.enter(StageState::ResponseCollection);
        self.control
            .post(ControlMessage::StageResponse(ResponseStage { trial_number: n }))
            .await?;
        self.await_sync_ack(Stage::ResponseCollection, n).await?;
        let deadline = Instant::now() + self.timing.response_timeout();
        self.collect_responses(deadline, &[]).await?;

        // Feedback
        let first = self
            .current
            .as_ref()
            .and_then(|t| t.race.first().cloned());
        let trial_score = score(first.as_ref().map(|f| f.response), target);
        self.total_score += trial_score;
        let feedback = Feedback {
            trial_number: n,
            trial_score,
            total_score: self.total_score,
            first_responder: first.as_ref().map(|f| f.responder),
            first_response: first.as_ref().map(|f| f.response),
            correct_category: target,
        };

        self.enter(StageState::Feedback);
        self.control
            .post(ControlMessage::StageFeedback(feedback.clone()))
            .await?;
        self.finish_trial(&feedback);
        self.gaze.set_sharing(true);
        self.await_sync_ack(Stage::Feedback, n).await?;
        let display = self.timing.feedback();
        self.show_for(display).await?;
        self.gaze.set_sharing(false);
        Ok(())
    }
}

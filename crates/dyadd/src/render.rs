//! Headless renderer: reports what a display would show through tracing.
//!
//! Logs at info when the screen would change meaningfully (stage, trial,
//! first-response signal, feedback, link quality) and every frame at trace.

use std::time::Duration;

use dyad_services::{Frame, LinkQuality, Renderer, StageState};

#[derive(Default)]
pub struct LogRenderer {
    last: Option<Shown>,
    last_countdown: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Shown {
    stage: StageState,
    trial: Option<u32>,
    signal: bool,
    link: LinkQuality,
}

impl Renderer for LogRenderer {
    fn draw(&mut self, frame: &Frame<'_>) {
        let shown = Shown {
            stage: frame.stage,
            trial: frame.trial,
            signal: frame.feedback_signal,
            link: frame.link,
        };

        if self.last != Some(shown) {
            self.announce(frame);
            self.last = Some(shown);
            self.last_countdown = None;
        }

        // Whole-second countdown while a timed display runs.
        if frame.remaining > Duration::ZERO {
            let secs = frame.remaining.as_secs();
            if self.last_countdown != Some(secs) {
                tracing::debug!(
                    stage = frame.stage.as_str(),
                    remaining = %format!("{:.1}s", frame.remaining.as_secs_f64()),
                    "countdown"
                );
                self.last_countdown = Some(secs);
            }
        }

        tracing::trace!(
            stage = frame.stage.as_str(),
            local = ?frame.local_gaze,
            remote = ?frame.remote_gaze.as_ref().map(|g| (g.sample.x, g.sample.y, g.sample.valid)),
            sharing = frame.sharing,
            "frame"
        );
    }
}

impl LogRenderer {
    fn announce(&self, frame: &Frame<'_>) {
        let trial = frame.trial;
        match frame.stage {
            StageState::AwaitStart => tracing::info!("waiting for the other station"),
            StageState::GridDisplay => {
                let target = frame.params.map(|p| p.target_position);
                let cell = frame
                    .layout
                    .zip(target)
                    .and_then(|(layout, pos)| layout.cell(pos).map(|c| (c.center_x, c.center_y)));
                tracing::info!(?trial, ?target, ?cell, "study the grid");
            }
            StageState::ResponseCollection if frame.feedback_signal => {
                tracing::info!(?trial, "response received");
            }
            StageState::ResponseCollection => {
                tracing::info!(?trial, "what was in the red square? (f/l/h/c)");
            }
            StageState::Feedback => match frame.feedback {
                Some(fb) => tracing::info!(
                    ?trial,
                    correct = %fb.correct_category,
                    first_responder = ?fb.first_responder,
                    first_response = ?fb.first_response,
                    score = fb.trial_score,
                    total = fb.total_score,
                    "feedback"
                ),
                None => tracing::info!(?trial, "feedback"),
            },
            StageState::Ended => tracing::info!(total = frame.total_score, "session over"),
        }
        if frame.link != LinkQuality::Connected && frame.sharing {
            tracing::info!(link = ?frame.link, "remote gaze not live");
        }
    }
}

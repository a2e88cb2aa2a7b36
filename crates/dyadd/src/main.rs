//! dyadd — one station of a two-peer gaze-sharing memory experiment.
//!
//! Usage: `dyadd [initiator|follower]`. The argument overrides the
//! configured role.

use std::time::Duration;

use anyhow::{Context, Result};

use dyad_core::config::DyadConfig;
use dyad_core::wire::PeerRole;
use dyad_services::{PeerLink, SessionOutcome, Station};

mod input;
mod render;
mod sink;
mod tracker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = DyadConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config_path = DyadConfig::file_path();
    let mut config = DyadConfig::load_from(&config_path)
        .with_context(|| format!("invalid config {}", config_path.display()))?;

    if let Some(arg) = std::env::args().nth(1) {
        config.session.role = arg
            .parse::<PeerRole>()
            .with_context(|| format!("unknown role {arg:?}, expected initiator or follower"))?;
    }
    let role = config.session.role;
    tracing::info!(
        %role,
        control = %config.network.control_local(),
        peer = %config.network.control_remote(),
        gaze_listen = %config.network.gaze_local(),
        gaze_peer = %config.network.gaze_remote(),
        "dyadd starting"
    );

    let link = PeerLink::bind(&config).context("failed to bind channels")?;

    // ── Abort channel ────────────────────────────────────────────────────────
    let (abort_tx, abort_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let abort = abort_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("interrupt received, ending session");
            let _ = abort.send(());
        });
    }

    let stats_printer = {
        let ctx = link.ctx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await;
            loop {
                interval.tick().await;
                tracing::info!(
                    control = ?ctx.control_stats.snapshot(),
                    gaze = ?ctx.gaze_stats.snapshot(),
                    link = ?ctx.link_quality(),
                    "network stats"
                );
            }
        })
    };

    // ── Run the session ──────────────────────────────────────────────────────
    let screen = (config.session.screen_width, config.session.screen_height);
    let station = Station {
        gaze: tracker::from_kind(config.session.gaze_source, screen),
        input: Box::new(input::StdinInput::spawn()),
        renderer: Box::new(render::LogRenderer::default()),
        sink: Box::new(sink::JsonTrialSink::new(config.output.log_dir.clone(), role)),
    };
    let report = link.coordinator(&config, station, abort_rx).run().await;

    stats_printer.abort();
    link.close().await;

    tracing::info!(
        %role,
        score = %format!("{}/{}", report.total_score, report.trials_planned),
        accuracy = %format!("{:.1}%", report.accuracy_percent()),
        trials_logged = report.logs.len(),
        "final score"
    );

    match report.outcome {
        SessionOutcome::Completed | SessionOutcome::Aborted => Ok(()),
        SessionOutcome::PeerEnded { reason } => {
            anyhow::bail!("peer ended the session early ({})", reason.as_deref().unwrap_or("no reason"))
        }
        SessionOutcome::Desynchronized { waiting_for, after } => {
            anyhow::bail!("peer stopped answering: no {waiting_for} within {after:?}")
        }
        SessionOutcome::Failed(e) => anyhow::bail!("session failed: {e}"),
    }
}

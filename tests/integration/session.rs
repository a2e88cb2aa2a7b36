use crate::*;

use dyad_core::trial::score;
use dyad_core::wire::{
    ControlMessage, Feedback, GazeSample, Heartbeat, MessageKind, ResponseStage, ResponseUpdate,
    SessionStart, Stage, StartAck, SyncAck, TrialParameters,
};
use dyad_services::SessionOutcome;

fn fixed_grid() -> TrialParameters {
    TrialParameters {
        trial_number: 1,
        seed: 42,
        condition_array: [0u8, 1, 2, 3].repeat(16),
        target_position: 7,
        target_category: Category::House,
    }
}

/// Next control message from the peer that is not a repeated
/// `start_experiment`.
async fn next_from(fake: &FakePeer, timeout: Duration) -> Option<ControlMessage> {
    loop {
        let (env, _) = fake.recv(timeout).await?;
        if env.body.kind() != MessageKind::StartExperiment {
            return Some(env.body);
        }
    }
}

// ── Two real peers ────────────────────────────────────────────────────────────

/// Three trials, both stations answering: both sides finish, and both log
/// the initiator's outcome for every trial.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_both_peers_log_the_same_outcome() -> Result<()> {
    let (a, b) = config_pair(3);
    let ((ra, sa), (rb, sb)) = run_pair(
        a,
        TestStation::new(Some(Category::House)),
        b,
        TestStation::new(Some(Category::House)),
    )
    .await?;

    assert_eq!(ra.outcome, SessionOutcome::Completed);
    assert_eq!(rb.outcome, SessionOutcome::Completed);
    assert_eq!(ra.logs.len(), 3);
    assert_eq!(rb.logs.len(), 3);
    assert!(ra.persisted && rb.persisted);
    assert_eq!(*sa.sink.logs.lock().unwrap(), ra.logs);
    assert_eq!(*sb.sink.logs.lock().unwrap(), rb.logs);

    let mut running = 0;
    for (i, (la, lb)) in ra.logs.iter().zip(&rb.logs).enumerate() {
        let n = i as u32 + 1;
        assert_eq!((la.trial, lb.trial), (n, n));
        assert_eq!(la.seed, 42 + u64::from(n));
        assert_eq!(la.seed, lb.seed);
        assert_eq!(la.target_position, lb.target_position);
        assert_eq!(la.correct_category, lb.correct_category);
        assert_eq!(la.first_responder, lb.first_responder);
        assert_eq!(la.first_response, Some(Category::House));
        assert_eq!(la.first_response, lb.first_response);

        let expected = score(Some(Category::House), la.correct_category);
        running += expected;
        assert_eq!((la.trial_score, lb.trial_score), (expected, expected));
        assert_eq!((la.total_score, lb.total_score), (running, running));

        assert_eq!(
            la.local_response.as_ref().map(|r| r.responder),
            Some(PeerRole::Initiator)
        );
        assert_eq!(
            lb.local_response.as_ref().map(|r| r.responder),
            Some(PeerRole::Follower)
        );
        assert_eq!(la.spatial_layout, lb.spatial_layout);
    }
    assert_eq!(ra.total_score, running);
    assert_eq!(rb.total_score, running);

    // Gaze is shared during grid display and never while answering.
    for screen in [&sa.screen, &sb.screen] {
        let s = screen.lock().unwrap();
        assert!(s
            .history
            .iter()
            .any(|(stage, _, sharing)| *stage == StageState::GridDisplay && *sharing));
        assert!(!s
            .history
            .iter()
            .any(|(stage, _, sharing)| *stage == StageState::ResponseCollection && *sharing));
        assert_eq!(s.history.last().map(|h| h.0), Some(StageState::Ended));
        assert_eq!(s.signals, vec![1, 2, 3]);
    }
    Ok(())
}

/// Nobody answers: the trial times out with no first responder and no
/// point, and the session still completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_unanswered_trial_scores_zero() -> Result<()> {
    let (a, b) = config_pair(1);
    let ((ra, _), (rb, sb)) =
        run_pair(a, TestStation::new(None), b, TestStation::new(None)).await?;

    assert_eq!(ra.outcome, SessionOutcome::Completed);
    assert_eq!(rb.outcome, SessionOutcome::Completed);
    for log in ra.logs.iter().chain(&rb.logs) {
        assert_eq!(log.first_responder, None);
        assert_eq!(log.first_response, None);
        assert_eq!(log.trial_score, 0);
        assert!(log.local_response.is_none());
        assert!(log.remote_response.is_none());
    }
    assert_eq!(ra.accuracy_percent(), 0.0);
    assert!(sb.screen.lock().unwrap().signals.is_empty());
    Ok(())
}

/// The follower's operator aborts in the second trial: the follower tells
/// the initiator, and both keep the first trial.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_abort_reaches_the_peer() -> Result<()> {
    let (a, b) = config_pair(3);
    let ((ra, _), (rb, _)) = run_pair(
        a,
        TestStation::new(Some(Category::Face)),
        b,
        TestStation::aborting_in(2),
    )
    .await?;

    assert_eq!(rb.outcome, SessionOutcome::Aborted);
    assert_eq!(
        ra.outcome,
        SessionOutcome::PeerEnded {
            reason: Some("aborted".to_string())
        }
    );
    assert_eq!(ra.logs.len(), 1);
    assert_eq!(rb.logs.len(), 1);
    assert_eq!(ra.logs[0].first_responder, Some(PeerRole::Initiator));
    assert_eq!(rb.logs[0].first_responder, Some(PeerRole::Initiator));
    assert_eq!(ra.trials_planned, 3);
    assert!(ra.persisted && rb.persisted);
    Ok(())
}

// ── Initiator against a fake follower ─────────────────────────────────────────

/// A follower that never acknowledges the start: the initiator keeps
/// resending, gives up, and says so before starting any trial.
#[tokio::test]
async fn test_session_missing_ack_start_desynchronizes() -> Result<()> {
    let fake = FakePeer::bind().await;
    let fake_gaze = FakePeer::bind().await;
    let mut cfg = config_against(PeerRole::Initiator, fake.port(), fake_gaze.port());
    cfg.timing.session_start_timeout_ms = 600;
    cfg.timing.ack_timeout_ms = 200;

    let (report, _) = run_peer(cfg, TestStation::new(None)).await?;
    assert_eq!(
        report.outcome,
        SessionOutcome::Desynchronized {
            waiting_for: MessageKind::AckStart,
            after: Duration::from_millis(600),
        }
    );
    assert!(report.logs.is_empty());

    let seen = fake.drain(Duration::from_millis(200)).await;
    let kinds = kinds(&seen);
    assert!(
        kinds.iter().filter(|k| **k == "start_experiment").count() >= 2,
        "start_experiment was not resent: {kinds:?}"
    );
    assert!(!kinds.contains(&"stage_grid_display"));
    assert_eq!(
        seen.last().map(|e| e.body.clone()),
        Some(ControlMessage::end("desynchronized"))
    );
    assert!(fake_gaze.recv_raw(Duration::from_millis(50)).await.is_none());
    Ok(())
}

/// A follower that acks the start but never the grid: the first trial's
/// parameters go out, gaze is shared and tagged with the trial, then the
/// initiator times out on the grid ack.
#[tokio::test]
async fn test_session_missing_grid_ack_desynchronizes() -> Result<()> {
    let fake = FakePeer::bind().await;
    let fake_gaze = FakePeer::bind().await;
    let mut cfg = config_against(PeerRole::Initiator, fake.port(), fake_gaze.port());
    cfg.timing.ack_timeout_ms = 300;
    let initiator_ctl = local(cfg.network.control_port);

    let run = tokio::spawn(run_peer(cfg, TestStation::new(None)));

    let (start, _) = fake.recv(Duration::from_secs(2)).await.context("no start")?;
    assert_eq!(
        start.body,
        ControlMessage::StartExperiment(SessionStart { total_trials: 2 })
    );
    fake.send(initiator_ctl, ControlMessage::AckStart(StartAck { client_ready: true }))
        .await;

    let grid = next_from(&fake, Duration::from_secs(2)).await.context("no grid")?;
    let ControlMessage::StageGridDisplay(params) = grid else {
        bail!("expected stage_grid_display, got {grid:?}");
    };
    assert_eq!(params.trial_number, 1);
    assert_eq!(params.seed, 43);
    assert_eq!(params.condition_array.len(), 64);
    assert_eq!(
        Some(params.target_category),
        Category::from_index(params.condition_array[params.target_position as usize])
    );

    let (bytes, _) = fake_gaze
        .recv_raw(Duration::from_secs(1))
        .await
        .context("no gaze during grid display")?;
    let sample = GazeSample::decode(&bytes)?;
    assert_eq!(sample.origin, PeerRole::Initiator);
    assert_eq!(sample.trial, Some(1));
    assert_eq!((sample.x, sample.y), (10.0, -20.0));

    let (report, _) = run.await??;
    assert_eq!(
        report.outcome,
        SessionOutcome::Desynchronized {
            waiting_for: MessageKind::StageSyncAck,
            after: Duration::from_millis(300),
        }
    );
    let rest = fake.drain(Duration::from_millis(200)).await;
    assert_eq!(
        rest.last().map(|e| e.body.clone()),
        Some(ControlMessage::end("desynchronized"))
    );
    Ok(())
}

/// The follower's answer arrives while the initiator still waits for the
/// response-stage ack, and the initiator's own key comes later: the
/// follower is first.
#[tokio::test]
async fn test_session_remote_answer_queued_before_local_key_wins() -> Result<()> {
    let fake = FakePeer::bind().await;
    let fake_gaze = FakePeer::bind().await;
    let mut cfg = config_against(PeerRole::Initiator, fake.port(), fake_gaze.port());
    cfg.session.total_trials = 1;
    let initiator_ctl = local(cfg.network.control_port);

    let station = TestStation::answering_after(Category::Face, Duration::from_millis(150));
    let run = tokio::spawn(run_peer(cfg, station));

    fake.recv(Duration::from_secs(2)).await.context("no start")?;
    fake.send(initiator_ctl, ControlMessage::AckStart(StartAck { client_ready: true }))
        .await;
    next_from(&fake, Duration::from_secs(2)).await.context("no grid")?;
    fake.send(
        initiator_ctl,
        ControlMessage::StageSyncAck(SyncAck {
            ready: true,
            stage: Stage::GridDisplay,
            trial_number: 1,
        }),
    )
    .await;

    let stage = next_from(&fake, Duration::from_secs(2)).await.context("no stage_response")?;
    assert_eq!(stage, ControlMessage::StageResponse(ResponseStage { trial_number: 1 }));
    fake.send(
        initiator_ctl,
        ControlMessage::ResponseUpdate(ResponseUpdate {
            trial_number: 1,
            responder: PeerRole::Follower,
            response: Category::Car,
            reaction_time: 0.05,
        }),
    )
    .await;
    // Hold the ack until the initiator's key has been pressed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    fake.send(
        initiator_ctl,
        ControlMessage::StageSyncAck(SyncAck {
            ready: true,
            stage: Stage::ResponseCollection,
            trial_number: 1,
        }),
    )
    .await;

    let feedback = loop {
        match next_from(&fake, Duration::from_secs(2)).await.context("no feedback")? {
            ControlMessage::StageFeedback(f) => break f,
            ControlMessage::ResponseUpdate(u) => assert_eq!(u.responder, PeerRole::Initiator),
            other => bail!("unexpected {other:?}"),
        }
    };
    assert_eq!(feedback.first_responder, Some(PeerRole::Follower));
    assert_eq!(feedback.first_response, Some(Category::Car));
    fake.send(
        initiator_ctl,
        ControlMessage::StageSyncAck(SyncAck {
            ready: true,
            stage: Stage::Feedback,
            trial_number: 1,
        }),
    )
    .await;

    let (report, _) = run.await??;
    assert_eq!(report.outcome, SessionOutcome::Completed);
    let [log] = report.logs.as_slice() else {
        bail!("expected one trial log, got {}", report.logs.len());
    };
    assert_eq!(log.first_responder, Some(PeerRole::Follower));
    assert_eq!(
        log.local_response.as_ref().map(|r| (r.responder, r.response)),
        Some((PeerRole::Initiator, Category::Face))
    );
    Ok(())
}

// ── Follower against a fake initiator ─────────────────────────────────────────

/// One full trial driven by hand: the follower acks each stage, shares gaze
/// only while the grid is up, ignores a repeated grid and logs exactly what
/// the initiator decided.
#[tokio::test]
async fn test_session_follower_mirrors_the_initiator() -> Result<()> {
    let fake = FakePeer::bind().await;
    let fake_gaze = FakePeer::bind().await;
    let cfg = config_against(PeerRole::Follower, fake.port(), fake_gaze.port());
    let to = local(cfg.network.control_port);
    let grid_display = cfg.timing.grid_display();

    let run = tokio::spawn(run_peer(cfg, TestStation::new(None)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A lost ack is answered again.
    for _ in 0..2 {
        fake.send(to, ControlMessage::StartExperiment(SessionStart { total_trials: 1 }))
            .await;
        let (ack, _) = fake.recv(Duration::from_secs(1)).await.context("no ack_start")?;
        assert_eq!(ack.body, ControlMessage::AckStart(StartAck { client_ready: true }));
    }

    fake.send(to, ControlMessage::StageGridDisplay(fixed_grid())).await;
    let (ack, _) = fake.recv(Duration::from_secs(1)).await.context("no grid ack")?;
    assert_eq!(
        ack.body,
        ControlMessage::StageSyncAck(SyncAck {
            ready: true,
            stage: Stage::GridDisplay,
            trial_number: 1,
        })
    );

    // Gaze flows for the grid display, then stops.
    let started = tokio::time::Instant::now();
    let mut samples = Vec::new();
    while let Some((bytes, _)) = fake_gaze.recv_raw(Duration::from_millis(300)).await {
        samples.push(GazeSample::decode(&bytes)?);
    }
    assert!(!samples.is_empty(), "no gaze during grid display");
    assert!(started.elapsed() >= grid_display);
    assert!(samples
        .iter()
        .all(|s| s.origin == PeerRole::Follower && s.trial == Some(1)));
    assert!(samples.windows(2).all(|w| w[0].seq < w[1].seq));

    // The same grid again is ignored.
    fake.send(to, ControlMessage::StageGridDisplay(fixed_grid())).await;
    assert!(fake.recv(Duration::from_millis(200)).await.is_none());

    fake.send(to, ControlMessage::Ping(Heartbeat {})).await;
    let (pong, _) = fake.recv(Duration::from_secs(1)).await.context("no pong")?;
    assert_eq!(pong.body.kind(), MessageKind::Pong);

    fake.send(to, ControlMessage::StageResponse(ResponseStage { trial_number: 1 }))
        .await;
    let (ack, _) = fake.recv(Duration::from_secs(1)).await.context("no response ack")?;
    assert_eq!(
        ack.body,
        ControlMessage::StageSyncAck(SyncAck {
            ready: true,
            stage: Stage::ResponseCollection,
            trial_number: 1,
        })
    );

    fake.send(
        to,
        ControlMessage::ResponseUpdate(ResponseUpdate {
            trial_number: 1,
            responder: PeerRole::Initiator,
            response: Category::House,
            reaction_time: 0.5,
        }),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let feedback = Feedback {
        trial_number: 1,
        trial_score: 1,
        total_score: 1,
        first_responder: Some(PeerRole::Initiator),
        first_response: Some(Category::House),
        correct_category: Category::House,
    };
    fake.send(to, ControlMessage::StageFeedback(feedback)).await;
    let (ack, _) = fake.recv(Duration::from_secs(1)).await.context("no feedback ack")?;
    assert_eq!(
        ack.body,
        ControlMessage::StageSyncAck(SyncAck {
            ready: true,
            stage: Stage::Feedback,
            trial_number: 1,
        })
    );

    fake.send(to, ControlMessage::end("complete")).await;
    let (report, station) = run.await??;

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.trials_planned, 1);
    assert_eq!(report.total_score, 1);
    let [log] = report.logs.as_slice() else {
        bail!("expected one trial log, got {}", report.logs.len());
    };
    assert_eq!(log.trial, 1);
    assert_eq!(log.seed, 42);
    assert_eq!(log.target_position, 7);
    // Taken as sent, not re-derived from the condition array.
    assert_eq!(log.correct_category, Category::House);
    assert_eq!(log.first_responder, Some(PeerRole::Initiator));
    assert_eq!(log.trial_score, 1);
    assert!(log.local_response.is_none());
    assert_eq!(
        log.remote_response.as_ref().map(|r| (r.responder, r.response)),
        Some((PeerRole::Initiator, Category::House))
    );
    assert!(log.target_coordinates.is_some());
    assert_eq!(station.screen.lock().unwrap().signals, vec![1]);
    Ok(())
}

/// The initiator ending the session before any trial leaves the follower
/// with a peer-ended outcome and the reason given.
#[tokio::test]
async fn test_session_follower_reports_early_end() -> Result<()> {
    let fake = FakePeer::bind().await;
    let fake_gaze = FakePeer::bind().await;
    let cfg = config_against(PeerRole::Follower, fake.port(), fake_gaze.port());
    let to = local(cfg.network.control_port);

    let run = tokio::spawn(run_peer(cfg, TestStation::new(None)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    fake.send(to, ControlMessage::StartExperiment(SessionStart { total_trials: 4 }))
        .await;
    fake.recv(Duration::from_secs(1)).await.context("no ack_start")?;
    fake.send(to, ControlMessage::end("operator")).await;

    let (report, _) = run.await??;
    assert_eq!(
        report.outcome,
        SessionOutcome::PeerEnded {
            reason: Some("operator".to_string())
        }
    );
    assert_eq!(report.trials_planned, 4);
    assert!(report.logs.is_empty());
    assert!(report.persisted);

    // Nothing is sent back for a peer-initiated end.
    assert!(fake.recv(Duration::from_millis(100)).await.is_none());
    Ok(())
}

use scanbot_core::capabilities::ScanAction;
use scanbot_core::config::Settings;
use scanbot_core::error::ScanbotError;
use scanbot_core::notify::Reaction;
use scanbot_driver_mock::{
    simulated_pool, FaultScenario, MockConnector, RecordingNotifier, SimulatedInstrument,
};
use scanbot_experiment::procedures::{Survey, SurveyConfig, TipShaping, TipShapingConfig};
use scanbot_experiment::{ProcedureOutcome, Services, TaskState, TaskSupervisor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn supervisor(
    instrument: &SimulatedInstrument,
    data_dir: &Path,
) -> (TaskSupervisor, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let pool = simulated_pool(MockConnector::new(instrument.clone()), 2);
    let mut settings = Settings::default();
    settings.output.data_dir = data_dir.to_path_buf();
    let services = Services::new(pool, settings).with_notifier(notifier.clone());
    (TaskSupervisor::new(Arc::new(services)), notifier)
}

fn survey(n: usize, settle: Duration) -> SurveyConfig {
    SurveyConfig {
        n,
        pitch: Some(20e-9),
        size: Some(10e-9),
        settle,
        ..SurveyConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_survey_walks_the_snake() {
    let dir = tempfile::tempdir().unwrap();
    let instrument = SimulatedInstrument::new();
    let (supervisor, notifier) = supervisor(&instrument, dir.path());

    supervisor
        .start(Box::new(Survey::new(survey(2, Duration::ZERO))))
        .unwrap();
    let outcome = supervisor.join().await.unwrap();
    match outcome {
        ProcedureOutcome::Completed(summary) => assert_eq!(summary, "survey 'scanbot' done"),
        other => panic!("unexpected outcome {other:?}"),
    }

    let centers: Vec<(f64, f64)> = instrument
        .frames_set()
        .iter()
        .map(|f| (f.center_x * 1e9, f.center_y * 1e9))
        .collect();
    let expected = [(-10.0, -10.0), (10.0, -10.0), (10.0, 10.0), (-10.0, 10.0)];
    assert_eq!(centers.len(), expected.len());
    for (got, want) in centers.iter().zip(expected) {
        assert!((got.0 - want.0).abs() < 1e-6 && (got.1 - want.1).abs() < 1e-6, "{got:?} != {want:?}");
    }

    assert_eq!(instrument.saved_scans(), 4);
    assert_eq!(notifier.images().len(), 5);
    assert!(notifier.saw("Running scan 4 of 4"));
    assert_eq!(notifier.last_text().as_deref(), Some("survey 'scanbot' done"));
    assert!(notifier.reactions().contains(&Reaction::Success));
    assert_eq!(instrument.series_name(), "scanbot_");
    assert_eq!(supervisor.state(), TaskState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_tip_shaping_gives_up_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let instrument = SimulatedInstrument::new();
    let (supervisor, _notifier) = supervisor(&instrument, dir.path());

    let config = TipShapingConfig {
        n: 2,
        settle: Duration::ZERO,
        max_attempts: Some(1),
        ..TipShapingConfig::default()
    };
    supervisor.start(Box::new(TipShaping::new(config))).unwrap();

    match supervisor.join().await.unwrap() {
        ProcedureOutcome::Completed(summary) => {
            assert_eq!(summary, "Tip shaping failed after 1 attempts")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!instrument.tip_pulses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected_and_stop_restores_session() {
    let dir = tempfile::tempdir().unwrap();
    let instrument = SimulatedInstrument::new();
    let (supervisor, notifier) = supervisor(&instrument, dir.path());

    supervisor
        .start(Box::new(Survey::new(survey(3, Duration::from_secs(10)))))
        .unwrap();
    let second = supervisor.start(Box::new(Survey::new(survey(1, Duration::ZERO))));
    assert!(matches!(second, Err(ScanbotError::AlreadyRunning)));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(supervisor.state(), TaskState::Running);
    assert_eq!(instrument.series_name(), "scanbot_scanbot_");

    let outcome = supervisor.stop(true).await.unwrap();
    assert!(matches!(outcome, Some(ProcedureOutcome::Stopped)));
    assert_eq!(supervisor.state(), TaskState::Idle);
    assert_eq!(instrument.series_name(), "scanbot_");
    assert!(!instrument.is_scanning());
    assert!(notifier.saw("survey stopped"));
    assert!(notifier.reactions().contains(&Reaction::Stop));

    // the slot is free again
    supervisor
        .start(Box::new(Survey::new(survey(1, Duration::ZERO))))
        .unwrap();
    assert!(supervisor.join().await.unwrap().is_completed());
}

#[tokio::test(start_paused = true)]
async fn test_pause_parks_the_scan_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let instrument = SimulatedInstrument::builder().line_time(0.05).build();
    let (supervisor, notifier) = supervisor(&instrument, dir.path());

    supervisor
        .start(Box::new(Survey::new(survey(1, Duration::ZERO))))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    supervisor.pause().unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(supervisor.state(), TaskState::Paused);
    assert!(instrument
        .scan_actions()
        .iter()
        .any(|(a, _)| *a == ScanAction::Pause));
    assert_eq!(instrument.saved_scans(), 0);
    assert!(supervisor.pause().is_err());

    supervisor.resume().unwrap();
    let outcome = supervisor.join().await.unwrap();
    assert!(outcome.is_completed());
    assert!(instrument
        .scan_actions()
        .iter()
        .any(|(a, _)| *a == ScanAction::Resume));
    assert_eq!(instrument.saved_scans(), 1);
    let reactions = notifier.reactions();
    assert!(reactions.contains(&Reaction::Pause));
    assert!(reactions.contains(&Reaction::Play));
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_reported_and_session_restored() {
    let dir = tempfile::tempdir().unwrap();
    let instrument = SimulatedInstrument::new();
    instrument.faults().inject(FaultScenario::FailAfterN {
        operation: "frame_data_grab",
        count: 0,
    });
    let (supervisor, notifier) = supervisor(&instrument, dir.path());

    supervisor
        .start(Box::new(Survey::new(survey(1, Duration::ZERO))))
        .unwrap();
    let outcome = supervisor.join().await.unwrap();

    assert!(matches!(outcome, ProcedureOutcome::Failed(_)));
    assert!(notifier.saw("survey failed"));
    assert!(notifier.reactions().contains(&Reaction::Warning));
    assert_eq!(instrument.series_name(), "scanbot_");
    assert_eq!(supervisor.state(), TaskState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_parameters_are_rejected_before_admission() {
    let dir = tempfile::tempdir().unwrap();
    let instrument = SimulatedInstrument::new();
    let (supervisor, _notifier) = supervisor(&instrument, dir.path());

    let bad = SurveyConfig {
        n: 0,
        ..SurveyConfig::default()
    };
    let err = supervisor.start(Box::new(Survey::new(bad))).unwrap_err();
    assert!(matches!(err, ScanbotError::InvalidParameter(_)));
    assert_eq!(supervisor.state(), TaskState::Idle);
    assert!(instrument.scan_actions().is_empty());
}

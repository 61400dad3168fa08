//! End-to-end sessions against the simulated rig and scripted sources.

use std::path::PathBuf;

use tilt_decoder::actuators::RecordingActuator;
use tilt_decoder::config::{ActuationConfig, CooldownConfig, SessionConfig};
use tilt_decoder::error::{ControllerError, SessionError};
use tilt_decoder::processing::events::Event;
use tilt_decoder::processing::templates::{load_for_session, Relabel, TemplateFile};
use tilt_decoder::processing::trial::policy::CollectionPolicy;
use tilt_decoder::processing::trial::{DecoderSource, StopHandle, TrialRecord};
use tilt_decoder::session::{Session, SessionMode};
use tilt_decoder::sources::{MockActuator, MockEventSource, MockRig, MockRigConfig, ScriptedSource};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tilt-flow-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn fast_config(labels: Vec<u32>, dir: &PathBuf) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.labels = labels;
    config.channels = [(5, vec![1]), (6, vec![1])].into_iter().collect();
    config.collection.policy = CollectionPolicy::FixedWallClock;
    config.collection.timeout_ms = 2_000;
    config.collection.no_spike_wait_ms = Some(150);
    config.actuation = ActuationConfig {
        reward_ms: 1,
        punish_ms: 1,
    };
    config.cooldown = CooldownConfig {
        min_s: 0.0,
        max_s: 0.0,
    };
    config.output.log_dir = Some(dir.join("logs"));
    config.seed = Some(3);
    config
}

/// Simulated rig without background firing, so every trial decodes exactly.
fn rig(config: &SessionConfig) -> (MockEventSource, MockActuator) {
    MockRig::new(MockRigConfig {
        latency_ms: 5,
        background_rate_hz: 0.0,
        ..MockRigConfig::from_session(config)
    })
}

#[test]
fn baseline_closed_loop_and_sham_sessions_chain_through_template_files() {
    let dir = temp_dir("chain");

    // Baseline under the rig's native event codes.
    let mut baseline = fast_config(vec![9, 11, 12, 14], &dir);
    baseline.output.template_out = Some(dir.join("baseline.json"));
    let (source, actuator) = rig(&baseline);
    let outcome = Session::new(&baseline, SessionMode::Baseline)
        .run(8, Box::new(source), Box::new(actuator))
        .unwrap();
    assert_eq!(outcome.report.baseline, 8);
    assert_eq!(outcome.history.len(), 8);
    let saved = outcome.template.unwrap();

    // Closed loop with session labels 1..=4, remapped from the saved codes.
    let mut closed = fast_config(vec![1, 2, 3, 4], &dir);
    closed.template_remap = [(9, 1), (11, 2), (12, 3), (14, 4)].into_iter().collect();
    closed.output.template_out = Some(dir.join("closed.json"));
    let relabel = Relabel::new(closed.template_remap.clone()).unwrap();
    let template = load_for_session(&saved, &closed.binning, &closed.task, &relabel).unwrap();
    assert_eq!(template.templates.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);

    let (source, actuator) = rig(&closed);
    let outcome = Session::new(&closed, SessionMode::ClosedLoop)
        .with_template(template)
        .run(8, Box::new(source), Box::new(actuator))
        .unwrap();
    assert_eq!(outcome.report.psth, 8);
    assert_eq!(outcome.report.correct, 8);
    assert_eq!(outcome.report.accuracy(), Some(1.0));

    // Sham replays the closed-loop decisions in order.
    let recorded = TemplateFile::load(outcome.template.unwrap()).unwrap();
    assert_eq!(recorded.actual_events.len(), 8);
    assert_eq!(recorded.tilts.len(), 8);
    let expected: Vec<u32> = recorded.actual_events.clone();

    let sham = fast_config(vec![1, 2, 3, 4], &dir);
    let (source, actuator) = rig(&sham);
    let outcome = Session::new(&sham, SessionMode::Sham)
        .with_template(recorded)
        .run(8, Box::new(source), Box::new(actuator))
        .unwrap();
    assert_eq!(outcome.report.sham, 8);
    let replayed: Vec<u32> = outcome.history.iter().map(|r| r.label).collect();
    assert_eq!(replayed, expected);
    assert!(outcome.template.is_none());

    let trial_log = std::fs::read_to_string(dir.join("logs").join("trials.csv")).unwrap();
    assert_eq!(trial_log.lines().count(), 1 + 24);
    let summary = std::fs::read_to_string(dir.join("logs").join("session.log")).unwrap();
    assert_eq!(summary.matches("SESSION SUMMARY").count(), 3);
    let _ = std::fs::remove_dir_all(&dir);
}

fn decisions(history: &[TrialRecord]) -> Vec<(u32, Option<u32>, Option<DecoderSource>)> {
    history
        .iter()
        .map(|r| (r.label, r.predicted_label, r.decoder_result_source))
        .collect()
}

#[test]
fn recorded_closed_loop_session_replays_to_the_same_predictions() {
    let dir = temp_dir("playback");
    let labels = vec![1, 2, 3, 4];

    let mut baseline = fast_config(labels.clone(), &dir);
    baseline.output.template_out = Some(dir.join("baseline.json"));
    let (source, actuator) = rig(&baseline);
    let saved = Session::new(&baseline, SessionMode::Baseline)
        .run(8, Box::new(source), Box::new(actuator))
        .unwrap()
        .template
        .unwrap();

    // Live run with background firing so decoding is not trivially clean.
    let closed = fast_config(labels, &dir);
    let template = load_for_session(&saved, &closed.binning, &closed.task, &Relabel::identity()).unwrap();
    let (source, actuator) = MockRig::new(MockRigConfig {
        latency_ms: 5,
        background_rate_hz: 40.0,
        seed: Some(17),
        ..MockRigConfig::from_session(&closed)
    });
    let live = Session::new(&closed, SessionMode::ClosedLoop)
        .with_template(template.clone())
        .run(8, Box::new(source), Box::new(actuator))
        .unwrap();

    let (actuator, _) = RecordingActuator::new();
    let replay = Session::new(&closed, SessionMode::ClosedLoop)
        .with_template(template)
        .run(8, Box::new(ScriptedSource::from_history(&live.history)), Box::new(actuator))
        .unwrap();

    assert_eq!(replay.history.len(), 8);
    assert_eq!(decisions(&replay.history), decisions(&live.history));
    let _ = std::fs::remove_dir_all(&dir);
}

fn trigger(t: f64) -> Event {
    Event::Trigger {
        label: 1,
        timestamp: t,
    }
}

fn spike(t: f64) -> Event {
    Event::Spike {
        channel: 5,
        unit: 1,
        timestamp: t,
    }
}

fn scripted_config(dir: &PathBuf) -> SessionConfig {
    let mut config = fast_config(vec![1], dir);
    config.collection.policy = CollectionPolicy::NoWait;
    config.collection.timeout_ms = 300;
    config.collection.no_spike_wait_ms = Some(30);
    config
}

#[test]
fn silent_trials_are_retried_until_exhausted() {
    let dir = temp_dir("retry");
    let mut config = scripted_config(&dir);
    config.retry.enabled = true;
    config.retry.max_retries = 1;

    let source = ScriptedSource::new(vec![
        vec![trigger(1.0), spike(1.01)],
        vec![trigger(2.0)],
        vec![trigger(3.0)],
    ]);
    let (actuator, _) = RecordingActuator::new();
    let outcome = Session::new(&config, SessionMode::Baseline)
        .run(2, Box::new(source), Box::new(actuator))
        .unwrap();

    assert_eq!(outcome.history.len(), 3);
    let retry = &outcome.history[2];
    assert_eq!(retry.trial_index, 2);
    assert_eq!(retry.retry_of, Some(1));
    assert_eq!(retry.decoder_result_source, Some(DecoderSource::NoSpikes));
    assert_eq!(outcome.report.no_spikes, 2);
    assert_eq!(outcome.report.retried, vec![1]);
    assert_eq!(outcome.report.exhausted, vec![1]);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn collection_timeout_aborts_but_flushes_the_template() {
    let dir = temp_dir("timeout");
    let mut config = scripted_config(&dir);
    config.output.template_out = Some(dir.join("partial.json"));

    let source = ScriptedSource::new(vec![vec![trigger(1.0), spike(1.01)], vec![]]);
    let (actuator, _) = RecordingActuator::new();
    let err = Session::new(&config, SessionMode::Baseline)
        .run(2, Box::new(source), Box::new(actuator))
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert!(matches!(
        err,
        SessionError::Aborted {
            source: ControllerError::CollectionTimeout { .. },
            ..
        }
    ));
    assert_eq!(err.history().map(Vec::len), Some(1));
    let interrupted = err.partial_record().unwrap();
    assert_eq!(interrupted.trial_index, 1);
    assert!(interrupted.trigger_time.is_none());

    let flushed = TemplateFile::load(dir.join("partial.json")).unwrap();
    assert_eq!(flushed.tilts.len(), 1);
    assert!(flushed.templates.contains_key(&1));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stop_request_ends_the_session_cleanly() {
    let dir = temp_dir("stop");
    let config = scripted_config(&dir);
    let stop = StopHandle::new();
    stop.request();

    let source = ScriptedSource::new(vec![vec![trigger(1.0), spike(1.01)]]);
    let (actuator, _) = RecordingActuator::new();
    let outcome = Session::new(&config, SessionMode::Baseline)
        .with_stop(stop)
        .run(1, Box::new(source), Box::new(actuator))
        .unwrap();
    assert!(outcome.report.stopped_early);
    assert!(outcome.history.is_empty());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn closed_loop_without_a_template_is_a_config_error() {
    let dir = temp_dir("notemplate");
    let config = scripted_config(&dir);
    let (actuator, _) = RecordingActuator::new();
    let err = Session::new(&config, SessionMode::ClosedLoop)
        .run(1, Box::new(ScriptedSource::default()), Box::new(actuator))
        .unwrap_err();
    assert!(matches!(err, SessionError::Config(_)));
    assert_eq!(err.exit_code(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn incompatible_template_maps_to_exit_code_three() {
    let dir = temp_dir("mismatch");
    let path = dir.join("t.json");
    std::fs::write(
        &path,
        r#"{"1": {"5_1": [0, 0, 0, 0, 0]}, "info": {"post_time": 100, "bin_size": 20, "task": "tilt"}}"#,
    )
    .unwrap();

    let config = scripted_config(&dir);
    let err: SessionError = load_for_session(&path, &config.binning, &config.task, &Relabel::identity())
        .unwrap_err()
        .into();
    assert_eq!(err.exit_code(), 3);
    let _ = std::fs::remove_dir_all(&dir);
}

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::policy::{CollectionWindow, WindowStatus};
use super::{Decision, DecoderSource, StopHandle, TrialRecord, TrialState};
use crate::actuators::{ActuatorSink, ActuatorState};
use crate::config::SessionConfig;
use crate::error::{ActuatorError, ControllerError};
use crate::processing::classifier::{nearest, Classifier};
use crate::processing::events::{Event, Label, UnitKey};
use crate::processing::psth::SpikeAccumulator;
use crate::sources::EventSource;

/// A recorded decision replayed in sham mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShamPair {
    pub predicted: Label,
    pub actual: Label,
}

/// How trial decisions are made.
#[derive(Debug, Clone)]
pub enum DecisionMode {
    /// Baseline recording: no decoding, every trial rewarded.
    Baseline,
    /// Nearest-template PSTH decoding.
    Psth,
    /// Replay recorded decisions in order.
    Sham(VecDeque<ShamPair>),
}

#[derive(Debug, Clone, Copy)]
pub struct TrialSpec {
    pub index: usize,
    pub label: Label,
    pub retry_of: Option<usize>,
}

enum Played {
    Completed,
    TimedOut { elapsed_ms: u64 },
}

// TRIAL CONTROLLER ------------------------------------------------------------

pub struct TrialController<'a> {
    config: &'a SessionConfig,
    source: Box<dyn EventSource>,
    actuator: Box<dyn ActuatorSink>,
    classifier: Classifier,
    mode: DecisionMode,
    stop: StopHandle,
    rng: StdRng,
    state: TrialState,
}

impl<'a> TrialController<'a> {
    pub fn new(
        config: &'a SessionConfig,
        source: Box<dyn EventSource>,
        actuator: Box<dyn ActuatorSink>,
        classifier: Classifier,
        mode: DecisionMode,
        stop: StopHandle,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        TrialController {
            config,
            source,
            actuator,
            classifier,
            mode,
            stop,
            rng,
            state: TrialState::Armed,
        }
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    /// Runs one trial from arming to the end of its cooldown.
    ///
    /// On success the controller is left `Armed`, or `Terminated` if a stop
    /// was requested during the trial.
    ///
    /// Every fatal error carries the partial record of the interrupted trial.
    pub fn run_trial(&mut self, spec: TrialSpec) -> Result<TrialRecord, ControllerError> {
        self.transition(TrialState::Armed);
        let mut record = TrialRecord::new(spec.index, spec.label, self.classifier.keys().clone());
        record.retry_of = spec.retry_of;

        match self.play(&mut record) {
            Ok(Played::Completed) => {}
            Ok(Played::TimedOut { elapsed_ms }) => {
                return Err(self.abort(ControllerError::CollectionTimeout {
                    record: Box::new(record),
                    elapsed_ms,
                }))
            }
            Err(e) => return Err(self.abort(e.with_record(record))),
        }

        info!(
            trial = record.trial_index,
            label = record.label,
            predicted = ?record.predicted_label,
            source = ?record.decoder_result_source,
            decision = ?record.decision,
            "trial complete"
        );

        if self.stop.is_requested() {
            info!("stop requested; terminating after trial {}", record.trial_index);
            self.transition(TrialState::Terminated);
        } else {
            self.transition(TrialState::Armed);
        }
        Ok(record)
    }

    /// Arms, collects, decides, actuates and cools down, filling `record`.
    fn play(&mut self, record: &mut TrialRecord) -> Result<Played, ControllerError> {
        let stale = self.source.clear()?;
        if !stale.is_empty() {
            debug!(count = stale.len(), "drained stale events before arming");
        }
        let mut accumulator = SpikeAccumulator::new(record.monitored.clone());

        self.actuator.set_state(ActuatorState::Motion(record.label))?;
        let command_sent = Instant::now();
        let mut window = CollectionWindow::new(self.config.window(), &self.config.binning, command_sent);
        self.transition(TrialState::AwaitingTrigger);

        let status = self.collect(record, &mut window, &mut accumulator)?;
        record.got_response = window.got_response();

        if status == WindowStatus::TimedOut {
            let elapsed_ms = window.elapsed(Instant::now()).as_millis() as u64;
            return Ok(Played::TimedOut { elapsed_ms });
        }

        self.transition(TrialState::Classifying);
        let decision = self.decide(record, &accumulator);

        self.transition(TrialState::Actuating);
        self.actuate(decision)?;

        self.transition(TrialState::Cooldown);
        record.delay_s = self.cooldown();
        Ok(Played::Completed)
    }

    fn abort(&mut self, error: ControllerError) -> ControllerError {
        if let Err(e) = self.actuator.set_state(ActuatorState::Stop) {
            warn!("failed to stop actuator after aborted trial: {}", e);
        }
        self.transition(TrialState::Armed);
        error
    }

    /// Returns the rig to neutral and closes the event source.
    pub fn finish(&mut self) -> Result<(), ControllerError> {
        self.transition(TrialState::Terminated);
        self.actuator.set_state(ActuatorState::Stop)?;
        self.source.close()?;
        Ok(())
    }

    fn transition(&mut self, next: TrialState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "trial state");
            self.state = next;
        }
    }

    fn collect(
        &mut self,
        record: &mut TrialRecord,
        window: &mut CollectionWindow,
        accumulator: &mut SpikeAccumulator,
    ) -> Result<WindowStatus, ControllerError> {
        loop {
            match window.status(Instant::now()) {
                WindowStatus::Open => {}
                status => return Ok(status),
            }

            match self.source.next_event()? {
                Some(event) => self.observe(event.quantized(), record, window, accumulator),
                None => thread::sleep(self.source.poll_interval()),
            }
        }
    }

    fn observe(
        &mut self,
        event: Event,
        record: &mut TrialRecord,
        window: &mut CollectionWindow,
        accumulator: &mut SpikeAccumulator,
    ) {
        match event {
            Event::Spike {
                channel,
                unit,
                timestamp,
            } => {
                let key = UnitKey::new(channel, unit);
                let monitored = accumulator.is_monitored(&key);
                let qualifying = monitored && record.trigger_time.map_or(false, |t| timestamp >= t);
                if monitored {
                    accumulator.record(key, timestamp);
                }
                if qualifying {
                    window.on_qualifying_spike(timestamp);
                }
                record.push_event(event, !qualifying);
            }
            Event::Trigger { label, timestamp } => {
                if record.trigger_time.is_none() {
                    debug!(code = label, timestamp, "trigger received");
                    record.trigger_time = Some(timestamp);
                    window.on_trigger(timestamp, Instant::now());
                    record.push_event(event, false);
                    self.transition(TrialState::Collecting);
                } else {
                    record.warn(format!(
                        "extra trigger (code {}) at {:.4}s ignored",
                        label, timestamp
                    ));
                    record.push_event(event, true);
                }
            }
            Event::Other { .. } => record.push_event(event, false),
        }
    }

    fn decide(&mut self, record: &mut TrialRecord, accumulator: &SpikeAccumulator) -> Decision {
        let decision = match (record.trigger_time, record.got_response) {
            (Some(trigger), true) => match &mut self.mode {
                DecisionMode::Baseline => {
                    record.decoder_result_source = Some(DecoderSource::Baseline);
                    Decision::Reward
                }
                DecisionMode::Psth => {
                    let live = accumulator.responses(trigger, &self.config.binning);
                    let distances = self.classifier.distances(&live);
                    let predicted = nearest(&distances);
                    record.distances = distances;
                    match predicted {
                        Some(predicted) => {
                            record.decoder_result_source = Some(DecoderSource::Psth);
                            record.predicted_label = Some(predicted);
                            if predicted == record.label {
                                Decision::Reward
                            } else {
                                Decision::Punish
                            }
                        }
                        None => {
                            record.warn("no templates loaded; rewarding");
                            record.decoder_result_source = Some(DecoderSource::Baseline);
                            Decision::Reward
                        }
                    }
                }
                DecisionMode::Sham(pairs) => match pairs.pop_front() {
                    Some(pair) => {
                        if pair.actual != record.label {
                            record.warn(format!(
                                "sham pair recorded for label {} replayed on label {}",
                                pair.actual, record.label
                            ));
                        }
                        record.decoder_result_source = Some(DecoderSource::Sham);
                        record.predicted_label = Some(pair.predicted);
                        if pair.predicted == pair.actual {
                            Decision::Reward
                        } else {
                            Decision::Punish
                        }
                    }
                    None => {
                        record.warn("sham decisions exhausted; rewarding");
                        record.decoder_result_source = Some(DecoderSource::Baseline);
                        Decision::Reward
                    }
                },
            },
            _ => {
                error!(
                    trial = record.trial_index,
                    label = record.label,
                    "NO SPIKES collected in trial; check the recording path"
                );
                record.warn("no spikes collected");
                record.decoder_result_source = Some(DecoderSource::NoSpikes);
                Decision::Reward
            }
        };
        record.decision = Some(decision);
        decision
    }

    fn actuate(&mut self, decision: Decision) -> Result<(), ActuatorError> {
        let (on, off, hold_ms) = match decision {
            Decision::Reward => (
                ActuatorState::RewardOn,
                ActuatorState::RewardOff,
                self.config.actuation.reward_ms,
            ),
            Decision::Punish => (
                ActuatorState::PunishOn,
                ActuatorState::PunishOff,
                self.config.actuation.punish_ms,
            ),
        };
        self.actuator.set_state(on)?;
        thread::sleep(Duration::from_millis(hold_ms));
        self.actuator.set_state(off)?;
        self.actuator.set_state(ActuatorState::Stop)
    }

    fn cooldown(&mut self) -> f64 {
        let cooldown = &self.config.cooldown;
        let delay = if cooldown.max_s > cooldown.min_s {
            self.rng.gen_range(cooldown.min_s..=cooldown.max_s)
        } else {
            cooldown.min_s
        };
        thread::sleep(Duration::from_secs_f64(delay));
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::{CommandLog, RecordingActuator};
    use crate::config::{ActuationConfig, CooldownConfig};
    use crate::processing::classifier::Templates;
    use crate::processing::psth::bin_responses;
    use crate::processing::trial::policy::CollectionPolicy;
    use crate::error::SourceError;
    use crate::sources::ScriptedSource;

    fn fast_config(policy: CollectionPolicy) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.channels = [(5, vec![1]), (6, vec![1])].into_iter().collect();
        config.collection.policy = policy;
        config.collection.timeout_ms = 300;
        config.collection.no_spike_wait_ms = Some(30);
        config.actuation = ActuationConfig {
            reward_ms: 1,
            punish_ms: 1,
        };
        config.cooldown = CooldownConfig {
            min_s: 0.0,
            max_s: 0.0,
        };
        config.seed = Some(7);
        config
    }

    fn spike(channel: u32, t: f64) -> Event {
        Event::Spike {
            channel,
            unit: 1,
            timestamp: t,
        }
    }

    fn trigger(t: f64) -> Event {
        Event::Trigger {
            label: 1,
            timestamp: t,
        }
    }

    fn templates() -> Templates {
        let mut early = vec![0.0; 10];
        early[1] = 1.0;
        let mut late = vec![0.0; 10];
        late[8] = 1.0;
        let mut t = Templates::new();
        t.insert(1, [(UnitKey::new(5, 1), early)].into_iter().collect());
        t.insert(2, [(UnitKey::new(5, 1), late)].into_iter().collect());
        t
    }

    fn controller<'a>(
        config: &'a SessionConfig,
        scripts: Vec<Vec<Event>>,
        mode: DecisionMode,
    ) -> (TrialController<'a>, CommandLog) {
        let mut classifier = Classifier::new(&config.channels);
        classifier.merge_templates(templates());
        let (actuator, log) = RecordingActuator::new();
        let controller = TrialController::new(
            config,
            Box::new(ScriptedSource::new(scripts)),
            Box::new(actuator),
            classifier,
            mode,
            StopHandle::new(),
        );
        (controller, log)
    }

    fn spec(index: usize, label: Label) -> TrialSpec {
        TrialSpec {
            index,
            label,
            retry_of: None,
        }
    }

    #[test]
    fn decodes_and_rewards_a_matching_trial() {
        let config = fast_config(CollectionPolicy::DeadlineRelative);
        let script = vec![trigger(100.0), spike(5, 100.03), spike(6, 100.2)];
        let (mut controller, log) = controller(&config, vec![script], DecisionMode::Psth);

        let record = controller.run_trial(spec(0, 1)).unwrap();
        assert!(record.got_response);
        assert_eq!(record.trigger_time, Some(100.0));
        assert_eq!(record.decoder_result_source, Some(DecoderSource::Psth));
        assert_eq!(record.predicted_label, Some(1));
        assert_eq!(record.decision, Some(Decision::Reward));
        assert_eq!(record.distances.len(), 2);

        let responses = bin_responses(
            record.spikes(),
            &record.monitored,
            100.0,
            &config.binning,
        );
        assert_eq!(responses[&UnitKey::new(5, 1)], vec![0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ActuatorState::Motion(1),
                ActuatorState::RewardOn,
                ActuatorState::RewardOff,
                ActuatorState::Stop
            ]
        );
        assert_eq!(controller.state(), TrialState::Armed);
    }

    #[test]
    fn punishes_a_wrong_decode() {
        let config = fast_config(CollectionPolicy::NoWait);
        let script = vec![trigger(10.0), spike(5, 10.025)];
        let (mut controller, log) = controller(&config, vec![script], DecisionMode::Psth);

        let record = controller.run_trial(spec(0, 2)).unwrap();
        assert_eq!(record.predicted_label, Some(1));
        assert_eq!(record.decision, Some(Decision::Punish));
        assert!(log.lock().unwrap().contains(&ActuatorState::PunishOn));
    }

    #[test]
    fn silent_trial_falls_back_to_reward() {
        let config = fast_config(CollectionPolicy::NoWait);
        let (mut controller, log) = controller(&config, vec![vec![trigger(10.0)]], DecisionMode::Psth);

        let record = controller.run_trial(spec(0, 3)).unwrap();
        assert!(!record.got_response);
        assert_eq!(record.decoder_result_source, Some(DecoderSource::NoSpikes));
        assert_eq!(record.decision, Some(Decision::Reward));
        assert_eq!(record.predicted_label, None);
        assert!(log.lock().unwrap().contains(&ActuatorState::RewardOn));
    }

    #[test]
    fn missing_trigger_times_out_with_partial_record() {
        let config = fast_config(CollectionPolicy::NoWait);
        let (mut controller, log) = controller(&config, vec![vec![]], DecisionMode::Psth);

        match controller.run_trial(spec(4, 1)) {
            Err(ControllerError::CollectionTimeout { record, elapsed_ms }) => {
                assert!(elapsed_ms >= 300);
                assert_eq!(record.trial_index, 4);
                assert!(!record.got_response);
                assert!(record.events.is_empty());
            }
            other => panic!("expected collection timeout, got {:?}", other.map(|r| r.trial_index)),
        }
        assert_eq!(log.lock().unwrap().last(), Some(&ActuatorState::Stop));
    }

    #[test]
    fn extra_trigger_is_a_warning() {
        let config = fast_config(CollectionPolicy::DeadlineRelative);
        let script = vec![
            trigger(10.0),
            trigger(10.05),
            spike(5, 10.03),
            spike(5, 10.25),
        ];
        let (mut controller, _) = controller(&config, vec![script], DecisionMode::Psth);

        let record = controller.run_trial(spec(0, 1)).unwrap();
        assert_eq!(record.trigger_time, Some(10.0));
        assert_eq!(record.warnings.len(), 1);
        assert!(record.events[1].ignored);
        assert_eq!(record.decoder_result_source, Some(DecoderSource::Psth));
    }

    #[test]
    fn pre_trigger_spikes_are_ignored() {
        let config = fast_config(CollectionPolicy::NoWait);
        let script = vec![spike(5, 9.9), spike(9, 10.01), trigger(10.0), spike(5, 10.01)];
        let (mut controller, _) = controller(&config, vec![script], DecisionMode::Baseline);

        let record = controller.run_trial(spec(0, 1)).unwrap();
        let ignored: Vec<bool> = record.events.iter().map(|e| e.ignored).collect();
        assert_eq!(ignored, vec![true, true, false, false]);
        assert_eq!(record.decoder_result_source, Some(DecoderSource::Baseline));
    }

    #[test]
    fn leftovers_do_not_leak_into_the_next_trial() {
        let config = fast_config(CollectionPolicy::NoWait);
        let first = vec![trigger(10.0), spike(5, 10.01), spike(5, 10.05), trigger(11.0)];
        let second = vec![trigger(20.0), spike(5, 20.17)];
        let (mut controller, _) = controller(&config, vec![first, second], DecisionMode::Psth);

        let a = controller.run_trial(spec(0, 1)).unwrap();
        let b = controller.run_trial(spec(1, 2)).unwrap();
        assert_eq!(a.events.len(), 2);
        assert_eq!(b.trigger_time, Some(20.0));
        assert!(b.warnings.is_empty());
        assert_eq!(b.predicted_label, Some(2));
    }

    #[test]
    fn sham_mode_replays_recorded_decisions() {
        let config = fast_config(CollectionPolicy::NoWait);
        let pairs: VecDeque<ShamPair> = vec![ShamPair {
            predicted: 3,
            actual: 1,
        }]
        .into();
        let script = vec![trigger(10.0), spike(5, 10.03)];
        let (mut controller, _) = controller(&config, vec![script], DecisionMode::Sham(pairs));

        let record = controller.run_trial(spec(0, 1)).unwrap();
        assert_eq!(record.decoder_result_source, Some(DecoderSource::Sham));
        assert_eq!(record.predicted_label, Some(3));
        assert_eq!(record.decision, Some(Decision::Punish));
        assert!(record.distances.is_empty());
    }

    #[test]
    fn stop_request_terminates_after_the_trial() {
        let config = fast_config(CollectionPolicy::NoWait);
        let script = vec![trigger(10.0), spike(5, 10.03)];
        let (mut controller, _) = controller(&config, vec![script], DecisionMode::Psth);

        controller.stop_handle().request();
        controller.run_trial(spec(0, 1)).unwrap();
        assert_eq!(controller.state(), TrialState::Terminated);
    }

    /// Rig whose reward valve refuses to open.
    struct RewardLineDown;

    impl ActuatorSink for RewardLineDown {
        fn set_state(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
            match state {
                ActuatorState::RewardOn => Err(ActuatorError::Unavailable("reward line dropped".into())),
                _ => Ok(()),
            }
        }

        fn name(&self) -> &str {
            "reward-line-down"
        }
    }

    /// Delivers its events, then fails every later read.
    struct DroppingSource(VecDeque<Event>);

    impl EventSource for DroppingSource {
        fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
            match self.0.pop_front() {
                Some(event) => Ok(Some(event)),
                None => Err(SourceError::Unavailable("link lost".into())),
            }
        }

        fn clear(&mut self) -> Result<Vec<Event>, SourceError> {
            Ok(Vec::new())
        }

        fn close(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "dropping"
        }
    }

    #[test]
    fn actuator_failure_keeps_the_collected_trial() {
        let config = fast_config(CollectionPolicy::NoWait);
        let mut controller = TrialController::new(
            &config,
            Box::new(ScriptedSource::new(vec![vec![trigger(10.0), spike(5, 10.03)]])),
            Box::new(RewardLineDown),
            Classifier::new(&config.channels),
            DecisionMode::Baseline,
            StopHandle::new(),
        );

        let err = controller.run_trial(spec(2, 1)).unwrap_err();
        assert!(matches!(err, ControllerError::ActuatorFailed { .. }));
        let record = err.partial_record().unwrap();
        assert_eq!(record.trial_index, 2);
        assert_eq!(record.trigger_time, Some(10.0));
        assert_eq!(record.events.len(), 2);
        assert_eq!(record.decision, Some(Decision::Reward));
        assert_eq!(controller.state(), TrialState::Armed);
    }

    #[test]
    fn source_failure_mid_collection_keeps_the_partial_trial() {
        let config = fast_config(CollectionPolicy::DeadlineRelative);
        let (actuator, log) = RecordingActuator::new();
        let mut controller = TrialController::new(
            &config,
            Box::new(DroppingSource(vec![trigger(10.0), spike(5, 10.03)].into())),
            Box::new(actuator),
            Classifier::new(&config.channels),
            DecisionMode::Psth,
            StopHandle::new(),
        );

        match controller.run_trial(spec(0, 1)) {
            Err(ControllerError::SourceFailed { record, source }) => {
                assert!(matches!(source, SourceError::Unavailable(_)));
                assert!(!record.got_response);
                assert_eq!(record.events.len(), 2);
                assert_eq!(record.decision, None);
            }
            other => panic!("expected source failure, got {:?}", other.map(|r| r.trial_index)),
        }
        assert_eq!(log.lock().unwrap().last(), Some(&ActuatorState::Stop));
    }
}

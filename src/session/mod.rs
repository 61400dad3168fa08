//! Session runner: trial sequencing, retries, persistence and wind-down.

pub mod report;

use chrono::{Local, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info, warn};

pub use report::SessionReport;

use crate::actuators::ActuatorSink;
use crate::config::SessionConfig;
use crate::error::{ConfigError, ControllerError, SessionError};
use crate::processing::classifier::Classifier;
use crate::processing::events::Label;
use crate::processing::templates::{TemplateFile, TemplateStore};
use crate::processing::trial::controller::{DecisionMode, TrialController, TrialSpec};
use crate::processing::trial::{DecoderSource, StopHandle, TrialHistory, TrialRecord, TrialState};
use crate::recorder::{RecorderHandle, RecorderReport};
use crate::sources::EventSource;
use crate::utils::log::{log_with_header, TrialLog};

pub const SESSION_LOG: &str = "session.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// No decoding; every trial rewarded and a template built at the end.
    Baseline,
    /// Decode each trial against a loaded template.
    ClosedLoop,
    /// Replay a template file's recorded decisions.
    Sham,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionMode::Baseline => "baseline",
            SessionMode::ClosedLoop => "closed-loop",
            SessionMode::Sham => "sham",
        })
    }
}

/// Balanced, shuffled label order: each label appears `n_trials / labels` times.
pub fn build_trial_sequence<R: Rng + ?Sized>(
    labels: &[Label],
    n_trials: usize,
    rng: &mut R,
) -> Result<Vec<Label>, ConfigError> {
    if labels.is_empty() || n_trials == 0 {
        return Err(ConfigError::Invalid(
            "a session needs at least one label and one trial".into(),
        ));
    }
    if n_trials % labels.len() != 0 {
        return Err(ConfigError::Invalid(format!(
            "trial count {} is not divisible by the {} class labels",
            n_trials,
            labels.len()
        )));
    }
    let per_label = n_trials / labels.len();
    let mut sequence: Vec<Label> = labels
        .iter()
        .flat_map(|&label| std::iter::repeat(label).take(per_label))
        .collect();
    sequence.shuffle(rng);
    Ok(sequence)
}

/// What a finished session leaves behind.
#[derive(Debug)]
pub struct SessionOutcome {
    pub report: SessionReport,
    pub history: TrialHistory,
    /// Where the template file was written, if it was.
    pub template: Option<PathBuf>,
    pub recorder: Option<RecorderReport>,
}

enum Exit {
    Completed,
    Stopped,
    RecorderFailed,
    Fatal(ControllerError),
}

/// Per-session bookkeeping outside the controller.
struct Ledger {
    store: TemplateStore,
    log: Option<TrialLog>,
    retried: BTreeSet<usize>,
    exhausted: Vec<usize>,
    notes: Vec<String>,
}

impl Ledger {
    fn keep(&mut self, record: TrialRecord) {
        if let Some(log) = &mut self.log {
            if let Err(e) = log.append(&record) {
                warn!("trial log disabled: {}", e);
                self.log = None;
            }
        }
        self.store.push(record);
    }
}

// SESSION ---------------------------------------------------------------------

pub struct Session<'a> {
    config: &'a SessionConfig,
    mode: SessionMode,
    template: Option<TemplateFile>,
    recorder: Option<RecorderHandle>,
    stop: StopHandle,
    session_id: String,
    metadata: Map<String, Value>,
}

impl<'a> Session<'a> {
    pub fn new(config: &'a SessionConfig, mode: SessionMode) -> Self {
        Self {
            config,
            mode,
            template: None,
            recorder: None,
            stop: StopHandle::new(),
            session_id: Local::now().format("%Y%m%d-%H%M%S").to_string(),
            metadata: Map::new(),
        }
    }

    /// Template to decode against (closed loop) or replay (sham).
    pub fn with_template(mut self, template: TemplateFile) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_recorder(mut self, recorder: RecorderHandle) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Extra caller metadata stored in the template file's `info`.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    /// Runs the whole session.
    ///
    /// Templates and logs are flushed before any error is returned; fatal
    /// errors carry the trial history accumulated so far.
    pub fn run(
        mut self,
        n_trials: usize,
        source: Box<dyn EventSource>,
        actuator: Box<dyn ActuatorSink>,
    ) -> Result<SessionOutcome, SessionError> {
        let config = self.config;
        let (sequence, mode, classifier) = self.prepare(n_trials)?;
        info!(
            session = %self.session_id,
            mode = %self.mode,
            trials = sequence.len(),
            source = source.name(),
            actuator = actuator.name(),
            units = classifier.keys().len(),
            "session starting"
        );

        let log = config.output.log_dir.as_ref().and_then(|dir| {
            TrialLog::open(dir, &self.session_id)
                .map_err(|e| warn!("trial log unavailable: {}", e))
                .ok()
        });
        let mut ledger = Ledger {
            store: TemplateStore::new(config.binning),
            log,
            retried: BTreeSet::new(),
            exhausted: Vec::new(),
            notes: Vec::new(),
        };
        let mut controller = TrialController::new(
            config,
            source,
            actuator,
            classifier,
            mode,
            self.stop.clone(),
        );

        let exit = self.drive(&mut controller, &mut ledger, &sequence);
        let stopped = matches!(exit, Exit::Stopped);
        let (report, template, recorder) = self.wind_down(&mut controller, &mut ledger, stopped);

        match exit {
            Exit::Completed | Exit::Stopped => Ok(SessionOutcome {
                report,
                history: ledger.store.into_history(),
                template,
                recorder,
            }),
            Exit::RecorderFailed => Err(SessionError::RecorderFailed {
                history: ledger.store.into_history(),
            }),
            Exit::Fatal(source) => Err(SessionError::Aborted {
                source,
                history: ledger.store.into_history(),
            }),
        }
    }

    fn sequence_rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn prepare(&self, n_trials: usize) -> Result<(Vec<Label>, DecisionMode, Classifier), SessionError> {
        let config = self.config;
        let mut classifier = Classifier::new(&config.channels);

        let template = match (self.mode, &self.template) {
            (SessionMode::Baseline, Some(_)) => {
                info!("baseline session ignores the loaded template");
                None
            }
            (SessionMode::Baseline, None) => None,
            (_, Some(template)) => Some(template),
            (mode, None) => {
                return Err(ConfigError::Invalid(format!("{} mode needs a template file", mode)).into())
            }
        };
        if let Some(template) = template {
            for label in template.templates.keys() {
                if !config.labels.contains(label) {
                    warn!(label, "template label is not a session label");
                }
            }
            classifier.merge_templates(template.templates.clone());
        }

        match (self.mode, template) {
            (SessionMode::Sham, Some(template)) => {
                let pairs = template.sham_pairs();
                if pairs.is_empty() {
                    return Err(ConfigError::Invalid(
                        "template file has no recorded decisions to replay".into(),
                    )
                    .into());
                }
                if pairs.len() != n_trials {
                    info!(
                        recorded = pairs.len(),
                        requested = n_trials,
                        "sham session replays every recorded trial"
                    );
                }
                let sequence = pairs.iter().map(|pair| pair.actual).collect();
                Ok((sequence, DecisionMode::Sham(pairs.into()), classifier))
            }
            (SessionMode::ClosedLoop, Some(_)) => {
                let sequence = build_trial_sequence(&config.labels, n_trials, &mut self.sequence_rng())?;
                Ok((sequence, DecisionMode::Psth, classifier))
            }
            _ => {
                let sequence = build_trial_sequence(&config.labels, n_trials, &mut self.sequence_rng())?;
                Ok((sequence, DecisionMode::Baseline, classifier))
            }
        }
    }

    /// Runs the first pass, then retry passes for silent trials.
    fn drive(&self, controller: &mut TrialController<'_>, ledger: &mut Ledger, sequence: &[Label]) -> Exit {
        let config = self.config;
        let mut pending: VecDeque<TrialSpec> = sequence
            .iter()
            .enumerate()
            .map(|(index, &label)| TrialSpec {
                index,
                label,
                retry_of: None,
            })
            .collect();
        let mut next_index = sequence.len();
        let mut silent: Vec<(usize, Label)> = Vec::new();
        let mut attempts: BTreeMap<usize, usize> = BTreeMap::new();
        let mut recorder_noted = false;

        loop {
            let Some(spec) = pending.pop_front() else {
                if silent.is_empty() {
                    return Exit::Completed;
                }
                for (original, label) in silent.drain(..) {
                    let count = attempts.entry(original).or_insert(0);
                    if *count >= config.retry.max_retries {
                        warn!(trial = original, "retries exhausted; trial stays without spikes");
                        ledger.exhausted.push(original);
                        continue;
                    }
                    *count += 1;
                    ledger.retried.insert(original);
                    pending.push_back(TrialSpec {
                        index: next_index,
                        label,
                        retry_of: Some(original),
                    });
                    next_index += 1;
                }
                if !pending.is_empty() {
                    info!(count = pending.len(), "retrying trials without spikes");
                }
                continue;
            };

            if self.stop.is_requested() {
                return Exit::Stopped;
            }
            if let Some(recorder) = &self.recorder {
                if recorder.has_failed() {
                    if config.recorder.abort_on_failure {
                        error!("recorder failed; aborting session");
                        return Exit::RecorderFailed;
                    }
                    if !recorder_noted {
                        warn!("recorder failed; continuing without recording");
                        ledger.notes.push("recorder failed during the session".into());
                        recorder_noted = true;
                    }
                }
            }

            match controller.run_trial(spec) {
                Ok(record) => {
                    if config.retry.enabled && record.decoder_result_source == Some(DecoderSource::NoSpikes) {
                        silent.push((spec.retry_of.unwrap_or(spec.index), spec.label));
                    }
                    ledger.keep(record);
                }
                Err(e) => {
                    error!("trial {} failed: {}", spec.index, e);
                    return Exit::Fatal(e);
                }
            }
            if controller.state() == TrialState::Terminated {
                return Exit::Stopped;
            }
        }
    }

    /// Neutralises the rig, stops the recorder and persists everything it can.
    fn wind_down(
        &mut self,
        controller: &mut TrialController<'_>,
        ledger: &mut Ledger,
        stopped: bool,
    ) -> (SessionReport, Option<PathBuf>, Option<RecorderReport>) {
        let config = self.config;
        if let Err(e) = controller.finish() {
            warn!("failed to shut down rig cleanly: {}", e);
            ledger.notes.push(format!("shutdown: {}", e));
        }

        let recorder = match self.recorder.take().map(RecorderHandle::stop) {
            Some(Ok(report)) => Some(report),
            Some(Err(e)) => {
                warn!("recorder: {}", e);
                ledger.notes.push(format!("recorder: {}", e));
                None
            }
            None => None,
        };

        let template = match &config.output.template_out {
            Some(path) if !ledger.store.history().is_empty() => {
                let mut metadata = self.metadata.clone();
                metadata.insert("session".into(), Value::from(self.session_id.clone()));
                metadata.insert("mode".into(), Value::from(self.mode.to_string()));
                metadata.insert("created_at".into(), Value::from(Utc::now().to_rfc3339()));
                match ledger.store.to_file(&config.task, metadata).save(path) {
                    Ok(()) => Some(path.clone()),
                    Err(e) => {
                        error!("failed to save template: {}", e);
                        ledger.notes.push(format!("template not saved: {}", e));
                        None
                    }
                }
            }
            _ => None,
        };

        let mut report = SessionReport::from_history(self.mode, ledger.store.history());
        report.retried = ledger.retried.iter().copied().collect();
        report.exhausted = ledger.exhausted.clone();
        report.stopped_early = stopped;
        report.notes = ledger.notes.clone();
        if let Some(recorder) = &recorder {
            report.recorder_samples = Some(recorder.samples);
            report.recorder_error = recorder.error.clone();
        }

        if let Some(dir) = &config.output.log_dir {
            let header = format!("SESSION SUMMARY {}", self.session_id);
            if let Err(e) = log_with_header(dir, SESSION_LOG, &header, &report.summary_text()) {
                warn!("failed to write session summary: {}", e);
            }
        }
        info!(session = %self.session_id, trials = report.trials, "session finished");
        (report, template, recorder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_balanced() {
        let mut rng = StdRng::seed_from_u64(11);
        let sequence = build_trial_sequence(&[1, 2, 3, 4], 12, &mut rng).unwrap();
        assert_eq!(sequence.len(), 12);
        for label in 1..=4 {
            assert_eq!(sequence.iter().filter(|&&l| l == label).count(), 3);
        }
    }

    #[test]
    fn sequence_is_reproducible_with_a_seed() {
        let a = build_trial_sequence(&[1, 2], 20, &mut StdRng::seed_from_u64(5)).unwrap();
        let b = build_trial_sequence(&[1, 2], 20, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn indivisible_trial_count_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(build_trial_sequence(&[1, 2, 3, 4], 10, &mut rng).is_err());
        assert!(build_trial_sequence(&[1, 2], 0, &mut rng).is_err());
    }

    #[test]
    fn mode_names_match_the_cli() {
        assert_eq!(SessionMode::ClosedLoop.to_string(), "closed-loop");
        let mode: SessionMode = serde_json::from_str("\"sham\"").unwrap();
        assert_eq!(mode, SessionMode::Sham);
    }
}

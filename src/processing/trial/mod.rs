pub mod controller;
pub mod policy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use super::events::{Event, Label, UnitKey};

/// Where a trial's decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderSource {
    Psth,
    Sham,
    NoSpikes,
    Baseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Reward,
    Punish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Armed,
    AwaitingTrigger,
    Collecting,
    Classifying,
    Actuating,
    Cooldown,
    Terminated,
}

/// An observed event and whether it was left out of the decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event: Event,
    #[serde(default)]
    pub ignored: bool,
}

/// Everything observed and decided during one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_index: usize,
    pub label: Label,
    /// Index of the failed trial this run repeats.
    #[serde(default)]
    pub retry_of: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub trigger_time: Option<f64>,
    pub events: Vec<RecordedEvent>,
    #[serde(default)]
    pub monitored: BTreeSet<UnitKey>,
    pub got_response: bool,
    pub decoder_result_source: Option<DecoderSource>,
    pub predicted_label: Option<Label>,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub distances: Vec<(Label, f64)>,
    pub delay_s: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl TrialRecord {
    pub fn new(trial_index: usize, label: Label, monitored: BTreeSet<UnitKey>) -> Self {
        Self {
            trial_index,
            label,
            retry_of: None,
            started_at: Utc::now(),
            trigger_time: None,
            events: Vec::new(),
            monitored,
            got_response: false,
            decoder_result_source: None,
            predicted_label: None,
            decision: None,
            distances: Vec::new(),
            delay_s: 0.0,
            warnings: Vec::new(),
        }
    }

    pub fn push_event(&mut self, event: Event, ignored: bool) {
        self.events.push(RecordedEvent { event, ignored });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(trial = self.trial_index, "{}", message);
        self.warnings.push(message);
    }

    /// Every recorded spike as `(key, timestamp)`, ignored ones included.
    pub fn spikes(&self) -> impl Iterator<Item = (UnitKey, f64)> + '_ {
        self.events
            .iter()
            .filter_map(|recorded| match recorded.event {
                Event::Spike {
                    channel,
                    unit,
                    timestamp,
                } => Some((UnitKey::new(channel, unit), timestamp)),
                _ => None,
            })
    }

    pub fn monitored_channels(&self) -> BTreeSet<u32> {
        self.monitored.iter().map(|key| key.channel).collect()
    }

    /// Whether the decoded label matched, for trials with a prediction.
    pub fn is_correct(&self) -> Option<bool> {
        self.predicted_label.map(|predicted| predicted == self.label)
    }
}

/// Completed trials in the order they ran.
pub type TrialHistory = Vec<TrialRecord>;

/// Shared "stop after the current trial" request.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

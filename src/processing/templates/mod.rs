pub mod file;

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub use file::{load_for_session, Relabel, TemplateFile, TemplateInfo};

use super::classifier::{LabelTemplate, Templates};
use super::events::{channels_from_keys, Label, UnitKey};
use super::psth::{bin_responses, BinConfig, ResponseMap};
use super::trial::controller::ShamPair;
use super::trial::{DecoderSource, TrialHistory, TrialRecord};

/// Whether a trial can contribute to a template.
fn usable(record: &TrialRecord) -> bool {
    record.trigger_time.is_some() && record.decoder_result_source != Some(DecoderSource::NoSpikes)
}

/// Averages per-unit PSTHs across trials of the same label.
///
/// A trial missing a unit counts as a zero vector for that unit only when the
/// unit's channel was monitored during the trial; otherwise the trial is left
/// out of that unit's average. Trials without a trigger or flagged
/// `no_spikes` are skipped.
pub fn build_from_history(history: &[TrialRecord], bins: &BinConfig) -> Templates {
    let mut by_label: BTreeMap<Label, Vec<(&TrialRecord, ResponseMap)>> = BTreeMap::new();
    for record in history.iter().filter(|r| usable(r)) {
        let Some(trigger) = record.trigger_time else {
            continue;
        };
        let responses = bin_responses(record.spikes(), &record.monitored, trigger, bins);
        by_label.entry(record.label).or_default().push((record, responses));
    }

    let bins_n = bins.bins_n();
    let mut templates = Templates::new();
    for (label, trials) in by_label {
        let keys: BTreeSet<UnitKey> = trials
            .iter()
            .flat_map(|(record, _)| record.monitored.iter().copied())
            .collect();

        let mut template = LabelTemplate::new();
        for key in keys {
            let mut sum = vec![0.0; bins_n];
            let mut count = 0usize;
            for (record, responses) in &trials {
                if !record.monitored_channels().contains(&key.channel) {
                    continue;
                }
                if let Some(response) = responses.get(&key) {
                    for (total, &c) in sum.iter_mut().zip(response) {
                        *total += c as f64;
                    }
                }
                count += 1;
            }
            if count > 0 {
                template.insert(key, sum.into_iter().map(|s| s / count as f64).collect());
            }
        }
        debug!(label, units = template.len(), trials = trials.len(), "template built");
        templates.insert(label, template);
    }
    templates
}

/// Recorded (predicted, actual) pairs, in trial order.
pub fn decision_pairs(history: &[TrialRecord]) -> Vec<ShamPair> {
    history
        .iter()
        .filter_map(|record| {
            record.predicted_label.map(|predicted| ShamPair {
                predicted,
                actual: record.label,
            })
        })
        .collect()
}

// TEMPLATE STORE --------------------------------------------------------------

/// Owns the session's trial history and reduces it to a template file.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    bins: BinConfig,
    history: TrialHistory,
}

impl TemplateStore {
    pub fn new(bins: BinConfig) -> Self {
        Self {
            bins,
            history: TrialHistory::new(),
        }
    }

    pub fn push(&mut self, record: TrialRecord) {
        self.history.push(record);
    }

    pub fn history(&self) -> &TrialHistory {
        &self.history
    }

    pub fn into_history(self) -> TrialHistory {
        self.history
    }

    pub fn build_templates(&self) -> Templates {
        build_from_history(&self.history, &self.bins)
    }

    /// Template file carrying this session's templates and full provenance.
    pub fn to_file(&self, task: &str, metadata: serde_json::Map<String, serde_json::Value>) -> TemplateFile {
        let templates = self.build_templates();
        let pairs = decision_pairs(&self.history);
        let monitored: BTreeSet<UnitKey> = self
            .history
            .iter()
            .flat_map(|record| record.monitored.iter().copied())
            .collect();

        info!(
            labels = templates.len(),
            trials = self.history.len(),
            "template file assembled"
        );
        TemplateFile {
            templates,
            actual_events: pairs.iter().map(|p| p.actual).collect(),
            predicted_events: pairs.iter().map(|p| p.predicted).collect(),
            channel_dict: channels_from_keys(&monitored),
            info: TemplateInfo {
                post_time: self.bins.post_time_ms,
                bin_size: self.bins.bin_size_ms,
                task: task.to_string(),
                metadata,
            },
            tilts: self.history.clone(),
        }
    }
}

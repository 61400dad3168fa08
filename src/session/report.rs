use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;

use super::SessionMode;
use crate::processing::trial::{DecoderSource, TrialRecord};

/// End-of-session accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    pub mode: String,
    pub trials: usize,
    pub psth: usize,
    pub sham: usize,
    pub baseline: usize,
    pub no_spikes: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub no_spike_trials: Vec<usize>,
    /// Original indices of trials that were re-run.
    pub retried: Vec<usize>,
    /// Original indices still silent after the last allowed retry.
    pub exhausted: Vec<usize>,
    pub warnings: Vec<(usize, String)>,
    pub stopped_early: bool,
    pub recorder_samples: Option<usize>,
    pub recorder_error: Option<String>,
    /// Session-level problems that did not end the session.
    pub notes: Vec<String>,
}

impl SessionReport {
    pub fn from_history(mode: SessionMode, history: &[TrialRecord]) -> Self {
        let mut report = SessionReport {
            mode: mode.to_string(),
            trials: history.len(),
            ..Self::default()
        };
        for record in history {
            match record.decoder_result_source {
                Some(DecoderSource::Psth) => report.psth += 1,
                Some(DecoderSource::Sham) => report.sham += 1,
                Some(DecoderSource::Baseline) => report.baseline += 1,
                Some(DecoderSource::NoSpikes) => {
                    report.no_spikes += 1;
                    report.no_spike_trials.push(record.trial_index);
                }
                None => {}
            }
            match record.is_correct() {
                Some(true) => report.correct += 1,
                Some(false) => report.incorrect += 1,
                None => {}
            }
            report.warnings.extend(
                record
                    .warnings
                    .iter()
                    .map(|warning| (record.trial_index, warning.clone())),
            );
        }
        report
    }

    /// Fraction of decoded trials whose prediction matched.
    pub fn accuracy(&self) -> Option<f64> {
        let decoded = self.correct + self.incorrect;
        (decoded > 0).then(|| self.correct as f64 / decoded as f64)
    }

    pub fn summary_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "mode: {}", self.mode);
        let _ = writeln!(
            text,
            "trials: {} (psth {}, sham {}, baseline {}, no_spikes {})",
            self.trials, self.psth, self.sham, self.baseline, self.no_spikes
        );
        match self.accuracy() {
            Some(accuracy) => {
                let _ = writeln!(
                    text,
                    "accuracy: {}/{} ({:.1}%)",
                    self.correct,
                    self.correct + self.incorrect,
                    accuracy * 100.0
                );
            }
            None => {
                let _ = writeln!(text, "accuracy: n/a");
            }
        }
        let _ = writeln!(text, "no-spike trials: {:?}", self.no_spike_trials);
        let _ = writeln!(text, "retried: {:?}", self.retried);
        let _ = writeln!(text, "retries exhausted: {:?}", self.exhausted);
        let _ = writeln!(text, "warnings: {}", self.warnings.len());
        for (trial, warning) in &self.warnings {
            let _ = writeln!(text, "  trial {}: {}", trial, warning);
        }
        match (&self.recorder_error, self.recorder_samples) {
            (Some(error), _) => {
                let _ = writeln!(text, "recorder: FAILED ({})", error);
            }
            (None, Some(samples)) => {
                let _ = writeln!(text, "recorder: {} samples", samples);
            }
            (None, None) => {}
        }
        for note in &self.notes {
            let _ = writeln!(text, "note: {}", note);
        }
        let _ = write!(text, "stopped early: {}", if self.stopped_early { "yes" } else { "no" });
        text
    }

    pub fn print_summary(&self) {
        println!("\n{}", "===== SESSION SUMMARY =====".bold());
        println!("{} {}", "mode:".bold(), self.mode);
        println!(
            "{} {} (psth {}, sham {}, baseline {}, no_spikes {})",
            "trials:".bold(),
            self.trials,
            self.psth,
            self.sham,
            self.baseline,
            self.no_spikes
        );
        if let Some(accuracy) = self.accuracy() {
            let line = format!(
                "{}/{} ({:.1}%)",
                self.correct,
                self.correct + self.incorrect,
                accuracy * 100.0
            );
            println!("{} {}", "accuracy:".bold(), line.green());
        }
        if self.no_spikes > 0 {
            println!(
                "{} {:?}",
                "NO SPIKES in trials:".yellow().bold(),
                self.no_spike_trials
            );
        }
        if !self.retried.is_empty() {
            println!("{} {:?}", "retried:".bold(), self.retried);
        }
        if !self.exhausted.is_empty() {
            println!("{} {:?}", "retries exhausted:".red().bold(), self.exhausted);
        }
        for (trial, warning) in &self.warnings {
            println!("{} trial {}: {}", "warning".yellow(), trial, warning);
        }
        if let Some(error) = &self.recorder_error {
            println!("{} {}", "recorder FAILED:".red().bold(), error);
        }
        for note in &self.notes {
            println!("{} {}", "note:".yellow(), note);
        }
        if self.stopped_early {
            println!("{}", "stopped by operator".yellow());
        }
        println!("{}", "===========================".bold());
    }
}

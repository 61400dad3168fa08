//! Error types for the tilt decoder.
//!
//! Fatal conditions (template mismatch, collection timeout, startup failures)
//! carry whatever trial state was accumulated so the caller can still flush
//! a template or history file before exiting.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::processing::events::Label;
use crate::processing::trial::{TrialHistory, TrialRecord};

/// Session configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// YAML could not be parsed or produced
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value violates a configuration invariant
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures raised by an event source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("could not connect to event stream at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("event stream I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event source closed")]
    Closed,

    #[error("event source unavailable: {0}")]
    Unavailable(String),
}

/// Failures raised by an actuator sink.
#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("actuator I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("actuator unavailable: {0}")]
    Unavailable(String),
}

/// Template building, persistence and compatibility errors.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("failed to access template file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed template file: {0}")]
    Json(#[from] serde_json::Error),

    /// Saved template was built under a different session configuration
    #[error("template {field} mismatch: session uses {expected}, file has {found}")]
    Incompatible {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("template key {0:?} is not a class label")]
    InvalidLabel(String),

    #[error("malformed unit key {0:?} (expected \"channel_unit\")")]
    InvalidUnitKey(String),

    #[error("template vector for label {label}, key {key} has {found} bins, expected {expected}")]
    VectorLength {
        label: Label,
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("label remap is not injective: {first} and {second} both map to {target}")]
    NotInjective {
        first: Label,
        second: Label,
        target: Label,
    },

    #[error("label {0} has no entry in the label remap")]
    Unmapped(Label),

    #[error("flat template for label {label} has {found} values, expected {units} units x {bins_n} bins")]
    FlatLength {
        label: Label,
        units: usize,
        bins_n: usize,
        found: usize,
    },

    #[error("ActualEvents has {actual} entries but PredictedEvents has {predicted}")]
    UnpairedEvents { actual: usize, predicted: usize },
}

/// Errors raised by the recording sidecar.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("recorder I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("recorder CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("sample source failed: {0}")]
    Source(String),

    #[error("sample batch channel {channel} has {found} samples, expected {expected}")]
    RaggedBatch {
        channel: usize,
        expected: usize,
        found: usize,
    },

    #[error("recorder did not acknowledge stop within {0} ms")]
    JoinTimeout(u64),

    #[error("recorder thread panicked")]
    Panicked,
}

/// Errors ending a single trial.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Wall-clock timeout since the start command was exceeded
    #[error("collection timed out after {elapsed_ms} ms in trial {trial}", trial = .record.trial_index)]
    CollectionTimeout {
        record: Box<TrialRecord>,
        elapsed_ms: u64,
    },

    /// The event source failed while a trial was in progress
    #[error("event source failed in trial {trial}: {source}", trial = .record.trial_index)]
    SourceFailed {
        record: Box<TrialRecord>,
        #[source]
        source: SourceError,
    },

    /// The actuator failed while a trial was in progress
    #[error("actuator failed in trial {trial}: {source}", trial = .record.trial_index)]
    ActuatorFailed {
        record: Box<TrialRecord>,
        #[source]
        source: ActuatorError,
    },

    /// Failure outside a trial, e.g. while shutting the rig down
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Actuator(#[from] ActuatorError),
}

impl ControllerError {
    /// Attaches the in-progress trial to a bare source or actuator failure.
    pub fn with_record(self, record: TrialRecord) -> Self {
        match self {
            ControllerError::Source(source) => ControllerError::SourceFailed {
                record: Box::new(record),
                source,
            },
            ControllerError::Actuator(source) => ControllerError::ActuatorFailed {
                record: Box::new(record),
                source,
            },
            other => other,
        }
    }

    /// The trial that was running when the failure happened.
    pub fn partial_record(&self) -> Option<&TrialRecord> {
        match self {
            ControllerError::CollectionTimeout { record, .. }
            | ControllerError::SourceFailed { record, .. }
            | ControllerError::ActuatorFailed { record, .. } => Some(&**record),
            ControllerError::Source(_) | ControllerError::Actuator(_) => None,
        }
    }
}

/// Errors ending a whole session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The event source could not be opened
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    /// A trial failed fatally; history holds every trial run so far
    #[error("session aborted after {n} trials: {source}", n = .history.len())]
    Aborted {
        #[source]
        source: ControllerError,
        history: TrialHistory,
    },

    #[error("recording sidecar failed after {n} trials", n = .history.len())]
    RecorderFailed { history: TrialHistory },
}

impl SessionError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionError::Aborted {
                source: ControllerError::CollectionTimeout { .. },
                ..
            } => 2,
            SessionError::Template(_) => 3,
            _ => 1,
        }
    }

    /// The unfinished trial of an aborted session.
    pub fn partial_record(&self) -> Option<&TrialRecord> {
        match self {
            SessionError::Aborted { source, .. } => source.partial_record(),
            _ => None,
        }
    }

    /// Trial history accumulated before the failure, if any.
    pub fn history(&self) -> Option<&TrialHistory> {
        match self {
            SessionError::Aborted { history, .. } | SessionError::RecorderFailed { history } => {
                Some(history)
            }
            _ => None,
        }
    }
}

// src/config/mod.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actuators::MAX_MOTION_CODE;
use crate::error::ConfigError;
use crate::processing::events::{ChannelDict, Label};
use crate::processing::psth::BinConfig;
use crate::processing::trial::policy::{CollectionPolicy, WindowConfig};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Task tag stored in template files and checked on reload.
    pub task: String,
    pub labels: Vec<Label>,
    pub channels: ChannelDict,
    pub binning: BinConfig,
    pub collection: CollectionConfig,
    pub actuation: ActuationConfig,
    pub cooldown: CooldownConfig,
    pub retry: RetryConfig,
    pub recorder: RecorderConfig,
    pub output: OutputConfig,
    /// Template label → session label, applied when loading a template.
    pub template_remap: BTreeMap<Label, Label>,
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CollectionConfig {
    pub policy: CollectionPolicy,
    pub timeout_ms: u64,
    pub no_spike_wait_ms: Option<u64>,
    /// Read timeout used by the network source between polls.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ActuationConfig {
    pub reward_ms: u64,
    pub punish_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CooldownConfig {
    pub min_s: f64,
    pub max_s: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub channels: usize,
    pub sample_rate_hz: f64,
    pub batch_ms: u64,
    pub live_view: bool,
    pub queue_capacity: usize,
    pub join_timeout_ms: u64,
    pub abort_on_failure: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub template_in: Option<PathBuf>,
    pub template_out: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let channels: ChannelDict = (1..=8).map(|channel| (channel, vec![1])).collect();
        Self {
            task: "tilt".to_string(),
            labels: vec![1, 2, 3, 4],
            channels,
            binning: BinConfig {
                post_time_ms: 200,
                bin_size_ms: 20,
            },
            collection: CollectionConfig::default(),
            actuation: ActuationConfig::default(),
            cooldown: CooldownConfig::default(),
            retry: RetryConfig::default(),
            recorder: RecorderConfig::default(),
            output: OutputConfig::default(),
            template_remap: BTreeMap::new(),
            seed: None,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            policy: CollectionPolicy::DeadlineRelative,
            timeout_ms: 5_000,
            no_spike_wait_ms: Some(1_000),
            poll_interval_ms: 10,
        }
    }
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            reward_ms: 120,
            punish_ms: 2_000,
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            min_s: 1.5,
            max_s: 2.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("recording.csv"),
            channels: 4,
            sample_rate_hz: 1_000.0,
            batch_ms: 100,
            live_view: false,
            queue_capacity: 16,
            join_timeout_ms: 2_000,
            abort_on_failure: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            template_in: None,
            template_out: None,
            log_dir: Some(PathBuf::from("logs")),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.binning.validate()?;

        if self.task.is_empty() {
            return Err(ConfigError::Invalid("task tag must not be empty".into()));
        }
        if self.labels.is_empty() {
            return Err(ConfigError::Invalid("at least one class label is required".into()));
        }
        let mut seen = self.labels.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.labels.len() {
            return Err(ConfigError::Invalid("class labels must be unique".into()));
        }
        if let Some(label) = self.labels.iter().find(|&&label| label > MAX_MOTION_CODE) {
            return Err(ConfigError::Invalid(format!(
                "label {} does not fit the motion code (max {})",
                label, MAX_MOTION_CODE
            )));
        }
        if self.channels.values().all(|units| units.is_empty()) {
            return Err(ConfigError::Invalid("no units are monitored".into()));
        }
        if self.collection.timeout_ms == 0 {
            return Err(ConfigError::Invalid("collection timeout must be positive".into()));
        }
        if self.collection.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll interval must be positive".into()));
        }
        if !(self.cooldown.min_s >= 0.0 && self.cooldown.min_s <= self.cooldown.max_s) {
            return Err(ConfigError::Invalid(format!(
                "cooldown range [{}, {}] is invalid",
                self.cooldown.min_s, self.cooldown.max_s
            )));
        }
        let mut targets: Vec<Label> = self.template_remap.values().copied().collect();
        targets.sort_unstable();
        targets.dedup();
        if targets.len() != self.template_remap.len() {
            return Err(ConfigError::Invalid("template_remap must be injective".into()));
        }
        if self.recorder.enabled && (self.recorder.channels == 0 || self.recorder.batch_ms == 0) {
            return Err(ConfigError::Invalid(
                "recorder needs at least one channel and a positive batch period".into(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            policy: self.collection.policy,
            timeout: Duration::from_millis(self.collection.timeout_ms),
            no_spike_wait: self.collection.no_spike_wait_ms.map(Duration::from_millis),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SessionConfig, ConfigError> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config: SessionConfig = serde_yaml::from_str(&config_str)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &SessionConfig, path: P) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(config)?;

    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::events::{to_ticks, UnitKey, TICKS_PER_MS};
use crate::error::ConfigError;

/// Spike counts per bin for one unit.
pub type ResponseVector = Vec<u32>;

/// Per-unit responses for one trial.
pub type ResponseMap = BTreeMap<UnitKey, ResponseVector>;

// BIN CONFIG ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinConfig {
    pub post_time_ms: u32,
    pub bin_size_ms: u32,
}

impl BinConfig {
    pub fn new(post_time_ms: u32, bin_size_ms: u32) -> Result<Self, ConfigError> {
        let config = Self {
            post_time_ms,
            bin_size_ms,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bin_size_ms == 0 {
            return Err(ConfigError::Invalid("bin_size_ms must be positive".into()));
        }
        if self.post_time_ms == 0 || self.post_time_ms % self.bin_size_ms != 0 {
            return Err(ConfigError::Invalid(format!(
                "post_time_ms ({}) must be a positive multiple of bin_size_ms ({})",
                self.post_time_ms, self.bin_size_ms
            )));
        }
        Ok(())
    }

    pub fn bins_n(&self) -> usize {
        (self.post_time_ms / self.bin_size_ms) as usize
    }

    pub fn post_time_ticks(&self) -> i64 {
        self.post_time_ms as i64 * TICKS_PER_MS
    }

    /// Bin for a spike `delta_ticks` after the trigger; `None` outside `[0, post_time)`.
    pub fn bin_index(&self, delta_ticks: i64) -> Option<usize> {
        if delta_ticks < 0 {
            return None;
        }
        let index = (delta_ticks / (self.bin_size_ms as i64 * TICKS_PER_MS)) as usize;
        (index < self.bins_n()).then_some(index)
    }
}

// BINNING ---------------------------------------------------------------------

/// Bins spike observations relative to `trigger_ts` into one PSTH per key.
///
/// Every key in `keys` gets a vector, zero-filled when it did not fire.
/// Spikes on keys outside `keys`, before the trigger, or at or beyond
/// `trigger_ts + post_time` are dropped.
pub fn bin_responses<I>(
    spikes: I,
    keys: &BTreeSet<UnitKey>,
    trigger_ts: f64,
    config: &BinConfig,
) -> ResponseMap
where
    I: IntoIterator<Item = (UnitKey, f64)>,
{
    let bins_n = config.bins_n();
    let mut responses: ResponseMap = keys.iter().map(|&key| (key, vec![0; bins_n])).collect();
    let trigger_ticks = to_ticks(trigger_ts);

    for (key, timestamp) in spikes {
        let Some(response) = responses.get_mut(&key) else {
            continue;
        };
        if let Some(index) = config.bin_index(to_ticks(timestamp) - trigger_ticks) {
            response[index] += 1;
        }
    }

    responses
}

// ACCUMULATOR -----------------------------------------------------------------

/// Spikes gathered during one trial, built fresh from the monitored key set.
#[derive(Debug, Clone)]
pub struct SpikeAccumulator {
    keys: BTreeSet<UnitKey>,
    spikes: Vec<(UnitKey, f64)>,
}

impl SpikeAccumulator {
    pub fn new(keys: BTreeSet<UnitKey>) -> Self {
        Self {
            keys,
            spikes: Vec::new(),
        }
    }

    pub fn is_monitored(&self, key: &UnitKey) -> bool {
        self.keys.contains(key)
    }

    pub fn record(&mut self, key: UnitKey, timestamp: f64) {
        self.spikes.push((key, timestamp));
    }

    pub fn len(&self) -> usize {
        self.spikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spikes.is_empty()
    }

    pub fn responses(&self, trigger_ts: f64, config: &BinConfig) -> ResponseMap {
        bin_responses(self.spikes.iter().copied(), &self.keys, trigger_ts, config)
    }
}

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::TemplateError;

/// Class label of a tilt direction.
pub type Label = u32;

/// Monitored units per recording channel, as carried in template files.
pub type ChannelDict = BTreeMap<u32, Vec<u32>>;

// TIMESTAMP QUANTISATION ------------------------------------------------------

/// Timestamps are kept to four decimal places of a second.
const TICKS_PER_SECOND: f64 = 10_000.0;

/// Ticks (0.1 ms) per millisecond.
pub const TICKS_PER_MS: i64 = 10;

/// Rounds a source timestamp to the recorded precision.
pub fn quantize(timestamp: f64) -> f64 {
    (timestamp * TICKS_PER_SECOND).round() / TICKS_PER_SECOND
}

/// Converts a timestamp in seconds to integer ticks of 0.1 ms.
pub fn to_ticks(timestamp: f64) -> i64 {
    (timestamp * TICKS_PER_SECOND).round() as i64
}

// UNIT KEY --------------------------------------------------------------------

/// Identity of a sorted unit, written `"channel_unit"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    pub channel: u32,
    pub unit: u32,
}

impl UnitKey {
    pub fn new(channel: u32, unit: u32) -> Self {
        Self { channel, unit }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.channel, self.unit)
    }
}

impl FromStr for UnitKey {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TemplateError::InvalidUnitKey(s.to_string());
        let (channel, unit) = s.split_once('_').ok_or_else(invalid)?;
        Ok(Self {
            channel: channel.parse().map_err(|_| invalid())?,
            unit: unit.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for UnitKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UnitKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Expands a channel dictionary into the set of unit keys it monitors.
pub fn keys_from_channels(channels: &ChannelDict) -> BTreeSet<UnitKey> {
    channels
        .iter()
        .flat_map(|(&channel, units)| units.iter().map(move |&unit| UnitKey::new(channel, unit)))
        .collect()
}

/// Folds a key set back into channel dictionary form.
pub fn channels_from_keys<'a, I>(keys: I) -> ChannelDict
where
    I: IntoIterator<Item = &'a UnitKey>,
{
    let mut channels = ChannelDict::new();
    for key in keys {
        let units = channels.entry(key.channel).or_default();
        if !units.contains(&key.unit) {
            units.push(key.unit);
        }
    }
    for units in channels.values_mut() {
        units.sort_unstable();
    }
    channels
}

// EVENTS ----------------------------------------------------------------------

/// A typed event from the recording stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Spike {
        channel: u32,
        unit: u32,
        timestamp: f64,
    },
    Trigger {
        label: Label,
        timestamp: f64,
    },
    Other {
        code: u32,
        timestamp: f64,
    },
}

impl Event {
    pub fn timestamp(&self) -> f64 {
        match *self {
            Event::Spike { timestamp, .. }
            | Event::Trigger { timestamp, .. }
            | Event::Other { timestamp, .. } => timestamp,
        }
    }

    /// Same event with its timestamp rounded to the recorded precision.
    pub fn quantized(self) -> Self {
        match self {
            Event::Spike {
                channel,
                unit,
                timestamp,
            } => Event::Spike {
                channel,
                unit,
                timestamp: quantize(timestamp),
            },
            Event::Trigger { label, timestamp } => Event::Trigger {
                label,
                timestamp: quantize(timestamp),
            },
            Event::Other { code, timestamp } => Event::Other {
                code,
                timestamp: quantize(timestamp),
            },
        }
    }

    pub fn unit_key(&self) -> Option<UnitKey> {
        match *self {
            Event::Spike { channel, unit, .. } => Some(UnitKey::new(channel, unit)),
            _ => None,
        }
    }
}

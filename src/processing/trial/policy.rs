use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::processing::events::to_ticks;
use crate::processing::psth::BinConfig;

/// When the collection window closes once a trigger has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionPolicy {
    /// Close on the first qualifying spike.
    NoWait,
    /// Close once a qualifying spike is stamped at or after `trigger + post_time`.
    DeadlineRelative,
    /// Close once `post_time` of wall-clock time has passed since the start command.
    FixedWallClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    Open,
    Complete,
    /// The no-spike wait ran out before any qualifying spike arrived.
    NoSpikes,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub policy: CollectionPolicy,
    pub timeout: Duration,
    pub no_spike_wait: Option<Duration>,
}

/// Exit-condition bookkeeping for one trial's collection window.
#[derive(Debug, Clone)]
pub struct CollectionWindow {
    config: WindowConfig,
    post_time: Duration,
    post_time_ticks: i64,
    command_sent: Instant,
    trigger_ticks: Option<i64>,
    trigger_seen_at: Option<Instant>,
    got_response: bool,
    latest_spike_ticks: Option<i64>,
}

impl CollectionWindow {
    pub fn new(config: WindowConfig, bins: &BinConfig, command_sent: Instant) -> Self {
        Self {
            config,
            post_time: Duration::from_millis(bins.post_time_ms as u64),
            post_time_ticks: bins.post_time_ticks(),
            command_sent,
            trigger_ticks: None,
            trigger_seen_at: None,
            got_response: false,
            latest_spike_ticks: None,
        }
    }

    pub fn on_trigger(&mut self, timestamp: f64, now: Instant) {
        if self.trigger_ticks.is_none() {
            self.trigger_ticks = Some(to_ticks(timestamp));
            self.trigger_seen_at = Some(now);
        }
    }

    pub fn on_qualifying_spike(&mut self, timestamp: f64) {
        self.got_response = true;
        let ticks = to_ticks(timestamp);
        self.latest_spike_ticks = Some(self.latest_spike_ticks.map_or(ticks, |t| t.max(ticks)));
    }

    pub fn got_response(&self) -> bool {
        self.got_response
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.command_sent)
    }

    pub fn status(&self, now: Instant) -> WindowStatus {
        if let Some(trigger_ticks) = self.trigger_ticks {
            let complete = match self.config.policy {
                CollectionPolicy::NoWait => self.got_response,
                CollectionPolicy::DeadlineRelative => self
                    .latest_spike_ticks
                    .map_or(false, |t| t >= trigger_ticks + self.post_time_ticks),
                CollectionPolicy::FixedWallClock => self.elapsed(now) >= self.post_time,
            };
            if complete {
                return WindowStatus::Complete;
            }

            let waited_out = match (self.config.no_spike_wait, self.trigger_seen_at) {
                (Some(wait), Some(seen)) => now.duration_since(seen) >= wait,
                _ => false,
            };
            if !self.got_response && waited_out {
                return WindowStatus::NoSpikes;
            }
        }

        if self.elapsed(now) >= self.config.timeout {
            WindowStatus::TimedOut
        } else {
            WindowStatus::Open
        }
    }
}

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::EventSource;
use crate::actuators::{ActuatorSink, ActuatorState};
use crate::config::SessionConfig;
use crate::error::{ActuatorError, SourceError};
use crate::processing::events::{keys_from_channels, ChannelDict, Event, Label, UnitKey};

// -----------------------------------------------------------------------------
// SETUP FOR THE SIMULATED RIG
// -----------------------------------------------------------------------------

const EVOKED_SPIKES: usize = 3;
const EVOKED_JITTER_MS: f64 = 4.0;
const FIRST_PEAK_MS: f64 = 30.0;
const PEAK_SPACING_MS: f64 = 40.0;

#[derive(Debug, Clone)]
pub struct MockRigConfig {
    pub labels: Vec<Label>,
    pub channels: ChannelDict,
    /// Delay between a motion command and its trigger event.
    pub latency_ms: u64,
    /// Poisson background rate summed over every unit.
    pub background_rate_hz: f64,
    pub seed: Option<u64>,
}

impl MockRigConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            labels: config.labels.clone(),
            channels: config.channels.clone(),
            latency_ms: 30,
            background_rate_hz: 20.0,
            seed: config.seed,
        }
    }
}

struct RigState {
    config: MockRigConfig,
    keys: Vec<UnitKey>,
    origin: Instant,
    rng: StdRng,
    /// Scheduled events, ascending by timestamp.
    pending: VecDeque<Event>,
    next_background: f64,
    closed: bool,
}

impl RigState {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, event: Event) {
        let at = self
            .pending
            .partition_point(|queued| queued.timestamp() <= event.timestamp());
        self.pending.insert(at, event);
    }

    fn background_interval(&mut self) -> f64 {
        let rate = self.config.background_rate_hz;
        if rate <= 0.0 || self.keys.is_empty() {
            return f64::INFINITY;
        }
        -(1.0 - self.rng.gen::<f64>()).ln() / rate
    }

    /// Emits background firing up to `now`.
    fn advance(&mut self, now: f64) {
        while self.next_background <= now {
            let key = self.keys[self.rng.gen_range(0..self.keys.len())];
            let timestamp = self.next_background;
            self.schedule(Event::Spike {
                channel: key.channel,
                unit: key.unit,
                timestamp,
            });
            self.next_background += self.background_interval();
        }
    }

    /// Schedules the trigger and a label-tuned evoked response for a tilt.
    fn start_motion(&mut self, label: Label) {
        let trigger = self.now() + self.config.latency_ms as f64 / 1_000.0;
        self.schedule(Event::Trigger {
            label,
            timestamp: trigger,
        });

        let position = self
            .config
            .labels
            .iter()
            .position(|&l| l == label)
            .unwrap_or(0);
        for (i, key) in self.keys.clone().into_iter().enumerate() {
            let peak_ms = FIRST_PEAK_MS + ((position + i) % 4) as f64 * PEAK_SPACING_MS;
            for _ in 0..EVOKED_SPIKES {
                let jitter = self.rng.gen_range(-EVOKED_JITTER_MS..EVOKED_JITTER_MS);
                let offset_ms = (peak_ms + jitter).max(0.0);
                self.schedule(Event::Spike {
                    channel: key.channel,
                    unit: key.unit,
                    timestamp: trigger + offset_ms / 1_000.0,
                });
            }
        }
        debug!(label, trigger, "mock rig tilt scheduled");
    }
}

fn lock(state: &Mutex<RigState>) -> MutexGuard<'_, RigState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// -----------------------------------------------------------------------------
// RIG HANDLES
// -----------------------------------------------------------------------------

/// Simulated tilt rig: an actuator and an event source sharing one clock.
pub struct MockRig;

impl MockRig {
    pub fn new(config: MockRigConfig) -> (MockEventSource, MockActuator) {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let keys = keys_from_channels(&config.channels).into_iter().collect();
        let mut state = RigState {
            config,
            keys,
            origin: Instant::now(),
            rng,
            pending: VecDeque::new(),
            next_background: 0.0,
            closed: false,
        };
        state.next_background = state.background_interval();
        info!(
            units = state.keys.len(),
            rate_hz = state.config.background_rate_hz,
            "mock rig ready"
        );

        let state = Arc::new(Mutex::new(state));
        (
            MockEventSource {
                state: Arc::clone(&state),
            },
            MockActuator { state, last: None },
        )
    }
}

pub struct MockEventSource {
    state: Arc<Mutex<RigState>>,
}

impl EventSource for MockEventSource {
    fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(SourceError::Closed);
        }
        let now = state.now();
        state.advance(now);
        match state.pending.front() {
            Some(event) if event.timestamp() <= now => Ok(state.pending.pop_front()),
            _ => Ok(None),
        }
    }

    /// Flushes the rig's buffer, scheduled events included.
    fn clear(&mut self) -> Result<Vec<Event>, SourceError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(SourceError::Closed);
        }
        let now = state.now();
        state.advance(now);
        Ok(state.pending.drain(..).collect())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        lock(&self.state).closed = true;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(2)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub struct MockActuator {
    state: Arc<Mutex<RigState>>,
    last: Option<ActuatorState>,
}

impl ActuatorSink for MockActuator {
    fn set_state(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
        if self.last == Some(state) {
            return Ok(());
        }
        let mut rig = lock(&self.state);
        if rig.closed {
            return Err(ActuatorError::Unavailable("mock rig is closed".into()));
        }
        if let ActuatorState::Motion(label) = state {
            rig.start_motion(label);
        } else {
            debug!(?state, bits = state.bits(), "mock rig output");
        }
        self.last = Some(state);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

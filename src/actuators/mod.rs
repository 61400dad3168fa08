use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::ActuatorError;
use crate::processing::events::Label;

/// Named output states of the tilt rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorState {
    Stop,
    Motion(Label),
    RewardOn,
    RewardOff,
    PunishOn,
    PunishOff,
}

/// Highest label that fits the 4-bit motion code.
pub const MAX_MOTION_CODE: Label = 0x0F;

const MOTION_STROBE: u16 = 1 << 4;
const REWARD_LINE: u16 = 1 << 5;
const PUNISH_LINE: u16 = 1 << 6;

impl ActuatorState {
    /// Digital output word for this state: motion code on bits 0-3 with a
    /// strobe on bit 4, reward on bit 5, punish on bit 6.
    pub fn bits(&self) -> u16 {
        match *self {
            ActuatorState::Stop | ActuatorState::RewardOff | ActuatorState::PunishOff => 0,
            ActuatorState::Motion(label) => MOTION_STROBE | (label & MAX_MOTION_CODE) as u16,
            ActuatorState::RewardOn => REWARD_LINE,
            ActuatorState::PunishOn => PUNISH_LINE,
        }
    }
}

// ACTUATOR COMPONENT ----------------------------------------------------------
pub trait ActuatorSink: Send {
    /// Applies `state`. Repeating a state is not an error.
    fn set_state(&mut self, state: ActuatorState) -> Result<(), ActuatorError>;

    fn name(&self) -> &str;
}

/// Prints each command to the console; stands in for output hardware.
#[derive(Debug, Default)]
pub struct ConsoleActuator {
    last: Option<ActuatorState>,
}

impl ConsoleActuator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActuatorSink for ConsoleActuator {
    fn set_state(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
        if self.last == Some(state) {
            return Ok(());
        }
        let label = match state {
            ActuatorState::Motion(label) => format!("TILT {}", label).cyan(),
            ActuatorState::RewardOn => "REWARD".green(),
            ActuatorState::PunishOn => "PUNISH".red(),
            ActuatorState::Stop => "stop".white(),
            ActuatorState::RewardOff | ActuatorState::PunishOff => "off".white(),
        };
        println!("{} [{:#09b}]", label, state.bits());
        info!(?state, bits = state.bits(), "actuator");
        self.last = Some(state);
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Shared view of the commands a [`RecordingActuator`] received.
pub type CommandLog = Arc<Mutex<Vec<ActuatorState>>>;

/// Keeps every command in order; used for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingActuator {
    log: CommandLog,
}

impl RecordingActuator {
    pub fn new() -> (Self, CommandLog) {
        let log = CommandLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl ActuatorSink for RecordingActuator {
    fn set_state(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
        self.log
            .lock()
            .map_err(|_| ActuatorError::Unavailable("command log poisoned".into()))?
            .push(state);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

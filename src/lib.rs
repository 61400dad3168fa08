//! Closed-loop PSTH decoder for the tilt task.
//!
//! Trials are run by [`processing::trial::controller::TrialController`]
//! against an [`sources::EventSource`] and an [`actuators::ActuatorSink`];
//! [`session::Session`] sequences them and persists templates.

pub mod actuators;
pub mod config;
pub mod error;
pub mod processing;
pub mod recorder;
pub mod session;
pub mod sources;
pub mod utils;

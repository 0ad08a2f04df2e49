//! GPIO outputs driven by MQTT commands
//!
//! - [`controller`] - switch and button actuation on top of the hardware capability

pub mod controller;

pub use controller::{Effect, OutputController, BUTTON_PULSE_DURATION};

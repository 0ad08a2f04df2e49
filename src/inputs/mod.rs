//! Input side of the bridge
//!
//! Two producers feed one channel of [`InputEvent`]s:
//!
//! ```text
//! opto HAT  ──poll──► InputSampler (own thread) ──┐
//!                                                 ├──► mpsc ──► Engine
//! GPIO line ──edge──► GpioTrigger (irq thread) ───┘
//! ```
//!
//! - [`debounce`] - stability filter shared by both paths
//! - [`sampler`] - polling loop for opto-isolated inputs and edge wiring for GPIO inputs

pub mod debounce;
pub mod sampler;

pub use debounce::DebounceFilter;
pub use sampler::{GpioTrigger, InputSampler, SamplerError, SamplerHandle};

/// Confirmed input change handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// The debounced level of an opto-isolated input changed
    OptoChanged { name: String, level: bool },
    /// A GPIO input went from inactive to active
    GpioActivated { name: String },
}

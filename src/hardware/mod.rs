//! Hardware capability surface
//!
//! The rest of the bridge never talks to a GPIO or I2C driver directly. It only
//! sees the [`Hardware`] trait, which has two implementations:
//!
//! ```text
//! hardware/
//! ├── rpi.rs   - Raspberry Pi via rppal (I2C opto HAT + GPIO lines)
//! └── fake.rs  - in-memory stand-in for --disable-hw and for tests
//! ```
//!
//! Channel numbers are the 1-based inputs of the opto-isolated HAT. Line numbers
//! are BCM GPIO numbers. Levels passed to [`Hardware::write_line`] and to edge
//! callbacks are electrical levels (`true` = high); mapping them to logical
//! on/off through `active_low` is the caller's job.

pub mod fake;
pub mod rpi;

pub use fake::FakeHardware;
pub use rpi::RpiHardware;

/// Callback invoked from the hardware's interrupt context with the electrical
/// level observed on a line right after an edge.
pub type EdgeCallback = Box<dyn FnMut(bool) + Send + 'static>;

/// Errors raised by a hardware capability
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("Failed to initialize hardware: {0}")]
    Init(String),

    #[error("Failed to read input channel {channel}: {reason}")]
    Read { channel: u8, reason: String },

    #[error("Failed to write GPIO line {line}: {reason}")]
    Write { line: u8, reason: String },
}

/// Opaque access to the physical inputs and outputs of the board.
///
/// Implementations must be usable from the sampler thread and from the engine
/// task at the same time, hence `Send + Sync` and `&self` receivers.
pub trait Hardware: Send + Sync + std::fmt::Debug {
    /// Reads one channel of the opto-isolated input HAT.
    fn read_channel(&self, channel: u8) -> Result<bool, HardwareError>;

    /// Reads several channels in one pass, results in the order of `channels`.
    /// Boards exposing all channels through one register override this to
    /// return a coherent snapshot.
    fn read_channels(&self, channels: &[u8]) -> Vec<Result<bool, HardwareError>> {
        channels.iter().map(|&channel| self.read_channel(channel)).collect()
    }

    /// Drives a GPIO output line to the given electrical level.
    fn write_line(&self, line: u8, level: bool) -> Result<(), HardwareError>;

    /// Registers `callback` to be invoked on every edge of a GPIO input line.
    fn watch_edges(&self, line: u8, callback: EdgeCallback) -> Result<(), HardwareError>;

    /// Drops interrupt registrations. Output levels are left to the caller.
    fn release(&self) {}
}

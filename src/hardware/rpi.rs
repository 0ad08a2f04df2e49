use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rppal::gpio::{Event, Gpio, InputPin, OutputPin, Trigger};
use rppal::i2c::I2c;
use tracing::{debug, error, info, warn};

use super::{EdgeCallback, Hardware, HardwareError};

/// Sequent Microsystems 16 opto-isolated inputs HAT
pub mod seq_micro_hat {
    /// Only the first board of a stack is supported
    pub const STACK_LEVEL: u8 = 0;
    pub const MAX_CHANNELS: u8 = 16;
    pub const BASE_ADDRESS: u16 = 0x20;
    pub const INPUT_PORT_REGISTER: u8 = 0x00;
    /// Lines used by the HAT itself, unavailable for configuration
    pub const SHUTDOWN_BUTTON_GPIO: u8 = 26;
    pub const INTERRUPT_GPIO: u8 = 11;
    pub const I2C_SDA: u8 = 2;
    pub const I2C_SCL: u8 = 3;
    pub const RESERVED_GPIOS: [u8; 4] = [SHUTDOWN_BUTTON_GPIO, INTERRUPT_GPIO, I2C_SDA, I2C_SCL];

    // expander port bit wired to each HAT channel (index = channel - 1)
    pub(super) const CHANNEL_BIT_MAP: [u8; 16] = [15, 14, 13, 12, 11, 10, 9, 8, 0, 1, 2, 3, 4, 5, 6, 7];

    pub fn i2c_address(stack_level: u8) -> u16 {
        BASE_ADDRESS + u16::from(0x07 ^ stack_level)
    }
}

// Kernel-side filter applied on GPIO input interrupts
const EDGE_DEBOUNCE: Duration = Duration::from_millis(50);

pub struct RpiHardware {
    gpio: Gpio,
    i2c: Option<Mutex<I2c>>,
    outputs: Mutex<HashMap<u8, OutputPin>>,
    inputs: Mutex<HashMap<u8, InputPin>>,
}

impl std::fmt::Debug for RpiHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpiHardware")
            .field("opto_hat", &self.i2c.is_some())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RpiHardware {
    /// Opens the GPIO controller and, when `with_opto_hat` is set, the I2C bus
    /// of the opto-isolated HAT. The HAT is read once so that a missing board
    /// aborts startup instead of failing every sample.
    pub fn open(with_opto_hat: bool) -> Result<Self, HardwareError> {
        info!("Initializing GPIO controller");
        let gpio = Gpio::new().map_err(|e| HardwareError::Init(format!("GPIO: {}", e)))?;

        let i2c = if with_opto_hat {
            let address = seq_micro_hat::i2c_address(seq_micro_hat::STACK_LEVEL);
            info!("Initializing opto-isolated input HAT at I2C address {:#04x}", address);
            let mut bus = I2c::new().map_err(|e| HardwareError::Init(format!("I2C: {}", e)))?;
            bus.set_slave_address(address)
                .map_err(|e| HardwareError::Init(format!("I2C address {:#04x}: {}", address, e)))?;
            bus.smbus_read_word(seq_micro_hat::INPUT_PORT_REGISTER)
                .map_err(|e| {
                    HardwareError::Init(format!("opto-isolated input HAT not responding: {}", e))
                })?;
            Some(Mutex::new(bus))
        } else {
            debug!("No opto-isolated inputs configured, skipping I2C setup");
            None
        };

        Ok(Self {
            gpio,
            i2c,
            outputs: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
        })
    }

    /// One SMBus transaction covering all 16 channels
    fn read_port(&self) -> Result<u16, String> {
        let bus = self
            .i2c
            .as_ref()
            .ok_or_else(|| "opto-isolated input HAT was not initialized".to_string())?;
        lock(bus)
            .smbus_read_word(seq_micro_hat::INPUT_PORT_REGISTER)
            .map_err(|e| e.to_string())
    }
}

fn channel_level(port: u16, channel: u8) -> Result<bool, HardwareError> {
    if channel == 0 || channel > seq_micro_hat::MAX_CHANNELS {
        return Err(HardwareError::Read {
            channel,
            reason: "channel out of range".to_string(),
        });
    }
    let bit = seq_micro_hat::CHANNEL_BIT_MAP[usize::from(channel - 1)];
    // optocouplers pull the expander pin low when energized
    Ok(port & (1 << bit) == 0)
}

impl Hardware for RpiHardware {
    fn read_channel(&self, channel: u8) -> Result<bool, HardwareError> {
        let port = self
            .read_port()
            .map_err(|reason| HardwareError::Read { channel, reason })?;
        channel_level(port, channel)
    }

    fn read_channels(&self, channels: &[u8]) -> Vec<Result<bool, HardwareError>> {
        match self.read_port() {
            Ok(port) => channels
                .iter()
                .map(|&channel| channel_level(port, channel))
                .collect(),
            Err(reason) => channels
                .iter()
                .map(|&channel| {
                    Err(HardwareError::Read {
                        channel,
                        reason: reason.clone(),
                    })
                })
                .collect(),
        }
    }

    fn write_line(&self, line: u8, level: bool) -> Result<(), HardwareError> {
        let mut outputs = lock(&self.outputs);
        if !outputs.contains_key(&line) {
            let pin = self
                .gpio
                .get(line)
                .map_err(|e| HardwareError::Write {
                    line,
                    reason: e.to_string(),
                })?
                .into_output();
            debug!("Claimed GPIO{} as output", line);
            outputs.insert(line, pin);
        }
        if let Some(pin) = outputs.get_mut(&line) {
            if level {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
        Ok(())
    }

    fn watch_edges(&self, line: u8, mut callback: EdgeCallback) -> Result<(), HardwareError> {
        let mut pin = self
            .gpio
            .get(line)
            .map_err(|e| HardwareError::Init(format!("GPIO{}: {}", line, e)))?
            .into_input();

        pin.set_async_interrupt(Trigger::Both, Some(EDGE_DEBOUNCE), move |event: Event| {
            callback(event.trigger == Trigger::RisingEdge);
        })
        .map_err(|e| HardwareError::Init(format!("GPIO{} interrupt: {}", line, e)))?;

        info!("Watching edges on GPIO{}", line);
        lock(&self.inputs).insert(line, pin);
        Ok(())
    }

    fn release(&self) {
        for (line, pin) in lock(&self.inputs).iter_mut() {
            if let Err(e) = pin.clear_async_interrupt() {
                warn!("Failed to clear interrupt on GPIO{}: {}", line, e);
            }
        }
        lock(&self.inputs).clear();
        let released = lock(&self.outputs).len();
        if released > 0 {
            debug!("Releasing {} output lines", released);
        }
    }
}

impl Drop for RpiHardware {
    fn drop(&mut self) {
        if !lock(&self.inputs).is_empty() {
            error!("RpiHardware dropped without release(), clearing interrupts now");
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::seq_micro_hat::*;
    use super::{channel_level, HardwareError};

    #[test]
    fn first_stack_level_uses_top_address() {
        assert_eq!(i2c_address(0), 0x27);
        assert_eq!(i2c_address(7), 0x20);
    }

    #[test]
    fn channel_map_covers_every_port_bit_once() {
        let mut seen = [false; 16];
        for bit in CHANNEL_BIT_MAP {
            assert!(!seen[bit as usize]);
            seen[bit as usize] = true;
        }
    }

    #[test]
    fn one_port_value_decodes_every_channel() {
        // channel 1 (bit 15) and channel 9 (bit 0) energized
        let port = 0xFFFF & !(1 << 15) & !1;
        let levels: Vec<bool> = (1..=MAX_CHANNELS)
            .map(|channel| channel_level(port, channel).unwrap())
            .collect();

        assert!(levels[0]);
        assert!(levels[8]);
        assert_eq!(levels.iter().filter(|&&active| active).count(), 2);
        assert!(matches!(
            channel_level(port, 17),
            Err(HardwareError::Read { channel: 17, .. })
        ));
        assert!(channel_level(port, 0).is_err());
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::hardware::Hardware;
use crate::registry::{ActuationMode, EntityRegistry, Output};
use crate::stats::Stats;

/// Hold time of a button-mode pulse
pub const BUTTON_PULSE_DURATION: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PulseState {
    Idle,
    Pulsing { deadline: Instant },
}

#[derive(Debug, Clone, Copy)]
struct OutputState {
    level: bool,
    pulse: PulseState,
}

/// Outcome of a command or timer on one output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing to do (e.g. `payload_off` on a button, stale timer)
    None,
    /// No output with that name
    UnknownOutput,
    /// Payload matches neither `payload_on` nor `payload_off`
    Unrecognized,
    /// The line was driven; `level` must be published on the state topic
    Switched { level: bool },
    /// Button line driven active; release is due at `deadline`
    PulseStarted { deadline: Instant },
    /// Button was already pulsing, release postponed to `deadline`
    PulseExtended { deadline: Instant },
    /// The hardware rejected the write, nothing changed
    WriteFailed,
}

/// Sole owner of output runtime state
#[derive(Debug)]
pub struct OutputController {
    hardware: Arc<dyn Hardware>,
    registry: Arc<EntityRegistry>,
    states: HashMap<String, OutputState>,
    stats: Arc<Stats>,
}

impl OutputController {
    pub fn new(hardware: Arc<dyn Hardware>, registry: Arc<EntityRegistry>, stats: Arc<Stats>) -> Self {
        let states = registry
            .outputs()
            .map(|o| {
                (
                    o.name.clone(),
                    OutputState {
                        level: false,
                        pulse: PulseState::Idle,
                    },
                )
            })
            .collect();
        Self {
            hardware,
            registry,
            states,
            stats,
        }
    }

    /// Drives every line to its inactive level. Returns how many writes failed.
    pub fn initialize(&mut self) -> usize {
        info!("Driving {} outputs to their inactive level", self.states.len());
        self.drive_all_inactive()
    }

    /// Same as [`Self::initialize`], used on shutdown
    pub fn release_all(&mut self) -> usize {
        info!("Releasing {} outputs", self.states.len());
        self.drive_all_inactive()
    }

    fn drive_all_inactive(&mut self) -> usize {
        let mut failures = 0;
        for output in self.registry.outputs() {
            let Some(state) = self.states.get_mut(&output.name) else {
                continue;
            };
            match self.hardware.write_line(output.gpio, output.physical_level(false)) {
                Ok(()) => {
                    state.level = false;
                    state.pulse = PulseState::Idle;
                }
                Err(e) => {
                    Stats::bump(&self.stats.hardware_write_errors);
                    error!("Unable to release output [{}]: {}", output.name, e);
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Current logical level of every output, in registry order
    pub fn levels(&self) -> Vec<(&Output, bool)> {
        self.registry
            .outputs()
            .filter_map(|o| self.states.get(&o.name).map(|s| (o, s.level)))
            .collect()
    }

    pub fn handle_command(&mut self, name: &str, payload: &str, now: Instant) -> Effect {
        let Some(output) = self.registry.output(name) else {
            warn!("Command for unknown output [{}]", name);
            return Effect::UnknownOutput;
        };
        Stats::bump(&self.stats.commands_processed);

        let activate = if payload == output.payload_on {
            true
        } else if payload == output.payload_off {
            false
        } else {
            Stats::bump(&self.stats.invalid_payloads);
            warn!(
                "Ignoring payload [{}] for output [{}]: expected [{}] or [{}]",
                payload, output.name, output.payload_on, output.payload_off
            );
            return Effect::Unrecognized;
        };

        match output.mode {
            ActuationMode::Switch => self.drive(name, activate),
            ActuationMode::Button if !activate => {
                debug!("Ignoring [{}] on button output [{}]", payload, output.name);
                Effect::None
            }
            ActuationMode::Button => self.press(name, now),
        }
    }

    fn press(&mut self, name: &str, now: Instant) -> Effect {
        let deadline = now + BUTTON_PULSE_DURATION;
        let Some(state) = self.states.get_mut(name) else {
            return Effect::UnknownOutput;
        };
        if let PulseState::Pulsing { .. } = state.pulse {
            state.pulse = PulseState::Pulsing { deadline };
            debug!("Button [{}] re-triggered, pulse extended", name);
            return Effect::PulseExtended { deadline };
        }

        match self.drive(name, true) {
            Effect::Switched { .. } => {
                if let Some(state) = self.states.get_mut(name) {
                    state.pulse = PulseState::Pulsing { deadline };
                }
                Effect::PulseStarted { deadline }
            }
            other => other,
        }
    }

    /// Ends a button pulse whose deadline has passed
    pub fn release_pulse(&mut self, name: &str, now: Instant) -> Effect {
        match self.states.get(name).map(|s| s.pulse) {
            Some(PulseState::Pulsing { deadline }) if deadline <= now => {
                let effect = self.drive(name, false);
                if let Some(state) = self.states.get_mut(name) {
                    if effect != Effect::WriteFailed {
                        state.pulse = PulseState::Idle;
                    }
                }
                effect
            }
            Some(PulseState::Pulsing { .. }) => {
                debug!("Pulse of [{}] was extended, not releasing yet", name);
                Effect::None
            }
            _ => Effect::None,
        }
    }

    fn drive(&mut self, name: &str, on: bool) -> Effect {
        let Some(output) = self.registry.output(name) else {
            return Effect::UnknownOutput;
        };
        let Some(state) = self.states.get_mut(name) else {
            return Effect::UnknownOutput;
        };

        match self.hardware.write_line(output.gpio, output.physical_level(on)) {
            Ok(()) => {
                state.level = on;
                info!(
                    "Output [{}] turned {} (GPIO{} {})",
                    name,
                    if on { "ON" } else { "OFF" },
                    output.gpio,
                    if output.physical_level(on) { "high" } else { "low" }
                );
                Effect::Switched { level: on }
            }
            Err(e) => {
                Stats::bump(&self.stats.hardware_write_errors);
                error!("{}; state of [{}] left unchanged", e, name);
                Effect::WriteFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::FakeHardware;
    use crate::registry::{Entity, HaMetadata};

    impl OutputController {
        fn level(&self, name: &str) -> Option<bool> {
            self.states.get(name).map(|s| s.level)
        }

        fn is_pulsing(&self, name: &str) -> bool {
            matches!(
                self.states.get(name).map(|s| s.pulse),
                Some(PulseState::Pulsing { .. })
            )
        }
    }

    fn output(name: &str, gpio: u8, active_low: bool, mode: ActuationMode) -> Entity {
        Entity::Output(Output {
            name: name.to_string(),
            description: name.to_string(),
            gpio,
            active_low,
            command_topic: format!("rpi2home-assistant/{}", name),
            state_topic: format!("rpi2home-assistant/{}/state", name),
            payload_on: "ON".to_string(),
            payload_off: "OFF".to_string(),
            mode,
            home_assistant: HaMetadata {
                platform: "switch".to_string(),
                device_class: "switch".to_string(),
                icon: None,
                expire_after: None,
            },
        })
    }

    fn controller(entities: Vec<Entity>) -> (OutputController, Arc<FakeHardware>) {
        let hw = Arc::new(FakeHardware::new());
        let registry = Arc::new(EntityRegistry::new(entities).unwrap());
        let hardware: Arc<dyn Hardware> = hw.clone();
        (
            OutputController::new(hardware, registry, Arc::new(Stats::new())),
            hw,
        )
    }

    #[test]
    fn switch_on_then_off_with_active_low() {
        let (mut ctrl, hw) = controller(vec![output("alarm_siren", 20, true, ActuationMode::Switch)]);
        let now = Instant::now();

        assert_eq!(ctrl.initialize(), 0);
        assert_eq!(hw.line_level(20), Some(true));

        assert_eq!(
            ctrl.handle_command("alarm_siren", "ON", now),
            Effect::Switched { level: true }
        );
        assert_eq!(hw.line_level(20), Some(false));
        assert_eq!(ctrl.level("alarm_siren"), Some(true));

        assert_eq!(
            ctrl.handle_command("alarm_siren", "OFF", now),
            Effect::Switched { level: false }
        );
        assert_eq!(hw.line_level(20), Some(true));
        assert_eq!(hw.writes(), vec![(20, true), (20, false), (20, true)]);
    }

    #[test]
    fn repeated_on_redrives_the_line() {
        let (mut ctrl, hw) = controller(vec![output("light", 21, false, ActuationMode::Switch)]);
        let now = Instant::now();

        ctrl.handle_command("light", "ON", now);
        assert_eq!(
            ctrl.handle_command("light", "ON", now),
            Effect::Switched { level: true }
        );
        assert_eq!(hw.writes().len(), 2);
    }

    #[test]
    fn unrecognized_payload_changes_nothing() {
        let (mut ctrl, hw) = controller(vec![output("light", 21, false, ActuationMode::Switch)]);

        assert_eq!(
            ctrl.handle_command("light", "on", Instant::now()),
            Effect::Unrecognized
        );
        assert!(hw.writes().is_empty());
        assert_eq!(ctrl.stats.snapshot().invalid_payloads, 1);
        assert_eq!(
            ctrl.handle_command("nope", "ON", Instant::now()),
            Effect::UnknownOutput
        );
    }

    #[test]
    fn write_failure_keeps_previous_state() {
        let (mut ctrl, hw) = controller(vec![output("light", 21, false, ActuationMode::Switch)]);
        hw.fail_line(21, true);

        assert_eq!(
            ctrl.handle_command("light", "ON", Instant::now()),
            Effect::WriteFailed
        );
        assert_eq!(ctrl.level("light"), Some(false));
        assert_eq!(ctrl.stats.snapshot().hardware_write_errors, 1);
    }

    #[test]
    fn button_pulses_and_releases_after_deadline() {
        let (mut ctrl, hw) = controller(vec![output("gate", 22, false, ActuationMode::Button)]);
        let t0 = Instant::now();

        let deadline = t0 + BUTTON_PULSE_DURATION;
        assert_eq!(
            ctrl.handle_command("gate", "ON", t0),
            Effect::PulseStarted { deadline }
        );
        assert!(ctrl.is_pulsing("gate"));
        assert_eq!(hw.line_level(22), Some(true));

        // early timer does not release
        assert_eq!(
            ctrl.release_pulse("gate", t0 + Duration::from_millis(100)),
            Effect::None
        );
        assert_eq!(
            ctrl.release_pulse("gate", deadline),
            Effect::Switched { level: false }
        );
        assert!(!ctrl.is_pulsing("gate"));
        assert_eq!(hw.writes(), vec![(22, true), (22, false)]);
    }

    #[test]
    fn button_retrigger_extends_instead_of_double_pulsing() {
        let (mut ctrl, hw) = controller(vec![output("gate", 22, false, ActuationMode::Button)]);
        let t0 = Instant::now();

        ctrl.handle_command("gate", "ON", t0);
        let later = t0 + Duration::from_millis(300);
        assert_eq!(
            ctrl.handle_command("gate", "ON", later),
            Effect::PulseExtended {
                deadline: later + BUTTON_PULSE_DURATION
            }
        );
        assert_eq!(
            ctrl.release_pulse("gate", t0 + BUTTON_PULSE_DURATION),
            Effect::None
        );
        assert_eq!(
            ctrl.release_pulse("gate", later + BUTTON_PULSE_DURATION),
            Effect::Switched { level: false }
        );
        assert_eq!(hw.writes().len(), 2);
    }

    #[test]
    fn button_ignores_payload_off() {
        let (mut ctrl, hw) = controller(vec![output("gate", 22, false, ActuationMode::Button)]);

        assert_eq!(
            ctrl.handle_command("gate", "OFF", Instant::now()),
            Effect::None
        );
        assert!(hw.writes().is_empty());
    }

    #[test]
    fn release_all_drives_inactive_levels() {
        let (mut ctrl, hw) = controller(vec![
            output("siren", 20, true, ActuationMode::Switch),
            output("light", 21, false, ActuationMode::Switch),
        ]);
        let now = Instant::now();
        ctrl.handle_command("siren", "ON", now);
        ctrl.handle_command("light", "ON", now);

        assert_eq!(ctrl.release_all(), 0);
        assert_eq!(hw.line_level(20), Some(true));
        assert_eq!(hw.line_level(21), Some(false));
        assert!(ctrl.levels().iter().all(|(_, level)| !level));
    }
}

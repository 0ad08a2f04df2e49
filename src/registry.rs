//! Entity registry
//!
//! Resolved, immutable view of every entity declared in the configuration:
//! topics are expanded to their final form, payload and Home Assistant defaults
//! are filled in. Built once at startup and then shared read-only (`Arc`)
//! between the sampler, the engine and the MQTT bridge. Runtime state lives in
//! the component that owns it, keyed by entity name.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::config::{
    self, AppConfig, DEFAULT_EXPIRE_AFTER_SEC, DEFAULT_PAYLOAD_OFF, DEFAULT_PAYLOAD_ON,
    PLATFORM_BINARY_SENSOR, PLATFORM_BUTTON, PLATFORM_SWITCH,
};
use crate::hardware::rpi::seq_micro_hat;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("Entity name [{0}] is used more than once")]
    DuplicateName(String),

    #[error("Opto-isolated input [{name}] uses invalid or duplicated channel {input_num}")]
    InvalidChannel { name: String, input_num: u8 },

    #[error("GPIO{gpio} is claimed by both [{first}] and [{second}]")]
    SharedLine { gpio: u8, first: String, second: String },

    #[error("Command topic [{topic}] is bound to both [{first}] and [{second}]")]
    SharedCommandTopic {
        topic: String,
        first: String,
        second: String,
    },
}

/// How an output reacts to `payload_on`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationMode {
    /// Latching: stays on until `payload_off`
    Switch,
    /// Momentary: self-reverts after a fixed pulse
    Button,
}

/// Home Assistant metadata used by discovery
#[derive(Debug, Clone, PartialEq)]
pub struct HaMetadata {
    pub platform: String,
    pub device_class: String,
    pub icon: Option<String>,
    pub expire_after: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptoInput {
    pub name: String,
    pub description: String,
    pub input_num: u8,
    pub active_low: bool,
    pub stability_threshold: Duration,
    pub topic: String,
    pub payload_on: String,
    pub payload_off: String,
    pub home_assistant: HaMetadata,
}

impl OptoInput {
    pub fn payload(&self, level: bool) -> &str {
        if level {
            &self.payload_on
        } else {
            &self.payload_off
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpioInput {
    pub name: String,
    pub description: String,
    pub gpio: u8,
    pub active_low: bool,
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub name: String,
    pub description: String,
    pub gpio: u8,
    pub active_low: bool,
    pub command_topic: String,
    pub state_topic: String,
    pub payload_on: String,
    pub payload_off: String,
    pub mode: ActuationMode,
    pub home_assistant: HaMetadata,
}

impl Output {
    pub fn payload(&self, level: bool) -> &str {
        if level {
            &self.payload_on
        } else {
            &self.payload_off
        }
    }

    /// Electrical level that represents the logical `on` state
    pub fn physical_level(&self, on: bool) -> bool {
        on ^ self.active_low
    }
}

/// One configured entity
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    OptoIsolated(OptoInput),
    Gpio(GpioInput),
    Output(Output),
}

impl Entity {
    pub fn name(&self) -> &str {
        match self {
            Entity::OptoIsolated(e) => &e.name,
            Entity::Gpio(e) => &e.name,
            Entity::Output(e) => &e.name,
        }
    }

    fn gpio(&self) -> Option<u8> {
        match self {
            Entity::OptoIsolated(_) => None,
            Entity::Gpio(e) => Some(e.gpio),
            Entity::Output(e) => Some(e.gpio),
        }
    }
}

#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: Vec<Entity>,
    by_name: HashMap<String, usize>,
    by_command_topic: HashMap<String, usize>,
}

impl EntityRegistry {
    /// Indexes `entities`, rejecting anything that would make routing ambiguous
    pub fn new(entities: Vec<Entity>) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::new();
        let mut by_command_topic: HashMap<String, usize> = HashMap::new();
        let mut lines: HashMap<u8, usize> = HashMap::new();
        let mut channels = HashMap::new();

        for (idx, entity) in entities.iter().enumerate() {
            if by_name.insert(entity.name().to_string(), idx).is_some() {
                return Err(RegistryError::DuplicateName(entity.name().to_string()));
            }

            if let Some(gpio) = entity.gpio() {
                if let Some(&other) = lines.get(&gpio) {
                    return Err(RegistryError::SharedLine {
                        gpio,
                        first: entities[other].name().to_string(),
                        second: entity.name().to_string(),
                    });
                }
                lines.insert(gpio, idx);
            }

            match entity {
                Entity::OptoIsolated(input) => {
                    let in_range =
                        (1..=seq_micro_hat::MAX_CHANNELS).contains(&input.input_num);
                    if !in_range || channels.insert(input.input_num, idx).is_some() {
                        return Err(RegistryError::InvalidChannel {
                            name: input.name.clone(),
                            input_num: input.input_num,
                        });
                    }
                }
                Entity::Output(output) => {
                    if let Some(&other) = by_command_topic.get(&output.command_topic) {
                        return Err(RegistryError::SharedCommandTopic {
                            topic: output.command_topic.clone(),
                            first: entities[other].name().to_string(),
                            second: output.name.clone(),
                        });
                    }
                    by_command_topic.insert(output.command_topic.clone(), idx);
                }
                Entity::Gpio(_) => {}
            }
        }

        debug!("Entity registry built with {} entities", entities.len());
        Ok(Self {
            entities,
            by_name,
            by_command_topic,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, RegistryError> {
        let prefix = &config.home_assistant.default_topic_prefix;
        let mut entities = Vec::new();

        for input in &config.i2c_optoisolated_inputs {
            entities.push(Entity::OptoIsolated(OptoInput {
                name: input.name.clone(),
                description: description_or_name(&input.description, &input.name),
                input_num: input.input_num,
                active_low: input.active_low,
                stability_threshold: Duration::from_secs(input.filter.stability_threshold_sec),
                topic: resolve_topic(&input.mqtt.topic, prefix, &input.name),
                payload_on: payload_or(&input.mqtt.payload_on, DEFAULT_PAYLOAD_ON),
                payload_off: payload_or(&input.mqtt.payload_off, DEFAULT_PAYLOAD_OFF),
                home_assistant: HaMetadata {
                    platform: input
                        .home_assistant
                        .platform
                        .clone()
                        .unwrap_or_else(|| PLATFORM_BINARY_SENSOR.to_string()),
                    device_class: input.home_assistant.device_class.clone(),
                    icon: input.home_assistant.icon.clone(),
                    expire_after: Some(
                        input
                            .home_assistant
                            .expire_after
                            .unwrap_or(DEFAULT_EXPIRE_AFTER_SEC),
                    ),
                },
            }));
        }

        for input in &config.gpio_inputs {
            entities.push(Entity::Gpio(GpioInput {
                name: input.name.clone(),
                description: description_or_name(&input.description, &input.name),
                gpio: input.gpio,
                active_low: input.active_low,
                topic: resolve_topic(&input.mqtt.topic, prefix, &input.name),
                payload: input.mqtt.payload.clone(),
            }));
        }

        for output in &config.outputs {
            entities.push(Entity::Output(output_from_config(output, prefix)));
        }

        Self::new(entities)
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.by_name.get(name).map(|&idx| &self.entities[idx])
    }

    pub fn opto_inputs(&self) -> impl Iterator<Item = &OptoInput> {
        self.entities.iter().filter_map(|e| match e {
            Entity::OptoIsolated(input) => Some(input),
            _ => None,
        })
    }

    pub fn gpio_inputs(&self) -> impl Iterator<Item = &GpioInput> {
        self.entities.iter().filter_map(|e| match e {
            Entity::Gpio(input) => Some(input),
            _ => None,
        })
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.entities.iter().filter_map(|e| match e {
            Entity::Output(output) => Some(output),
            _ => None,
        })
    }

    pub fn opto_input(&self, name: &str) -> Option<&OptoInput> {
        match self.get(name) {
            Some(Entity::OptoIsolated(input)) => Some(input),
            _ => None,
        }
    }

    pub fn gpio_input(&self, name: &str) -> Option<&GpioInput> {
        match self.get(name) {
            Some(Entity::Gpio(input)) => Some(input),
            _ => None,
        }
    }

    pub fn output(&self, name: &str) -> Option<&Output> {
        match self.get(name) {
            Some(Entity::Output(output)) => Some(output),
            _ => None,
        }
    }

    /// Exact-match routing of an inbound command
    pub fn output_by_command_topic(&self, topic: &str) -> Option<&Output> {
        self.by_command_topic
            .get(topic)
            .and_then(|&idx| match &self.entities[idx] {
                Entity::Output(output) => Some(output),
                _ => None,
            })
    }

    pub fn command_topics(&self) -> impl Iterator<Item = &str> {
        self.outputs().map(|o| o.command_topic.as_str())
    }
}

fn output_from_config(output: &config::OutputConfig, prefix: &str) -> Output {
    let platform = output
        .home_assistant
        .platform
        .clone()
        .unwrap_or_else(|| PLATFORM_SWITCH.to_string());
    let mode = if platform == PLATFORM_BUTTON {
        ActuationMode::Button
    } else {
        ActuationMode::Switch
    };
    let command_topic = resolve_topic(&output.mqtt.topic, prefix, &output.name);
    let state_topic = output
        .mqtt
        .state_topic
        .clone()
        .unwrap_or_else(|| format!("{}/{}/state", prefix, output.name));

    Output {
        name: output.name.clone(),
        description: description_or_name(&output.description, &output.name),
        gpio: output.gpio,
        active_low: output.active_low,
        command_topic,
        state_topic,
        payload_on: payload_or(&output.mqtt.payload_on, DEFAULT_PAYLOAD_ON),
        payload_off: payload_or(&output.mqtt.payload_off, DEFAULT_PAYLOAD_OFF),
        mode,
        home_assistant: HaMetadata {
            platform,
            device_class: output.home_assistant.device_class.clone(),
            icon: output.home_assistant.icon.clone(),
            expire_after: None,
        },
    }
}

fn resolve_topic(explicit: &Option<String>, prefix: &str, name: &str) -> String {
    explicit
        .clone()
        .unwrap_or_else(|| format!("{}/{}", prefix, name))
}

fn payload_or(explicit: &Option<String>, default: &str) -> String {
    explicit.clone().unwrap_or_else(|| default.to_string())
}

fn description_or_name(description: &Option<String>, name: &str) -> String {
    description.clone().unwrap_or_else(|| name.to_string())
}

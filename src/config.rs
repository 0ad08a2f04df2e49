//! Application configuration
//!
//! Loaded once at startup from a TOML file, then merged with CLI flags and a few
//! environment variables. Everything is validated here so that the runtime
//! components can trust the structure they are handed: a [`ConfigError`] is the
//! only fatal error of the application.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::hardware::rpi::seq_micro_hat;
use crate::mqtt::config::MqttConfig;

pub const THIS_APP_NAME: &str = "rpi2home-assistant";
pub const CONFIG_FILE: &str = "/etc/rpi2home-assistant.toml";
pub const INTEGRATION_TESTS_OUTPUT_FILE: &str = "/tmp/integration-tests-output";

pub const DEFAULT_TOPIC_PREFIX: &str = "rpi2home-assistant";
pub const DEFAULT_DISCOVERY_TOPIC_PREFIX: &str = "homeassistant";
pub const DEFAULT_PUBLISH_PERIOD_MSEC: u64 = 1000;
pub const DEFAULT_EXPIRE_AFTER_SEC: u64 = 30;
pub const DEFAULT_PAYLOAD_ON: &str = "ON";
pub const DEFAULT_PAYLOAD_OFF: &str = "OFF";
pub const DEFAULT_STATS_LOG_PERIOD_SEC: u64 = 30;
pub const MANUFACTURER: &str = "github.com/f18m";

pub const PLATFORM_BINARY_SENSOR: &str = "binary_sensor";
pub const PLATFORM_SWITCH: &str = "switch";
pub const PLATFORM_BUTTON: &str = "button";

const GPIO_RANGE: std::ops::RangeInclusive<u8> = 1..=40;

/// Device classes Home Assistant accepts for each supported platform
pub fn allowed_device_classes(platform: &str) -> &'static [&'static str] {
    match platform {
        PLATFORM_BINARY_SENSOR => &[
            "battery",
            "battery_charging",
            "carbon_monoxide",
            "cold",
            "connectivity",
            "door",
            "garage_door",
            "gas",
            "heat",
            "light",
            "lock",
            "moisture",
            "motion",
            "moving",
            "occupancy",
            "opening",
            "plug",
            "power",
            "presence",
            "problem",
            "running",
            "safety",
            "smoke",
            "sound",
            "tamper",
            "update",
            "vibration",
            "window",
        ],
        PLATFORM_SWITCH => &["outlet", "switch"],
        PLATFORM_BUTTON => &["identify", "restart", "update"],
        _ => &[],
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid name [{0}]: only lowercase letters, digits and underscores are allowed")]
    InvalidName(String),

    #[error("The name [{0}] is not unique across the configuration")]
    DuplicateName(String),

    #[error("Invalid input_num {input_num} for entry [{name}]: {reason}")]
    InvalidInputNum {
        name: String,
        input_num: u8,
        reason: String,
    },

    #[error("Invalid GPIO {gpio} for entry [{name}]: {reason}")]
    InvalidGpio { name: String, gpio: u8, reason: String },

    #[error("Invalid MQTT topic [{topic}] for entry [{name}]: already used by another output")]
    DuplicateTopic { name: String, topic: String },

    #[error("Invalid Home Assistant platform [{platform}] for entry [{name}]: allowed values are {allowed:?}")]
    InvalidPlatform {
        name: String,
        platform: String,
        allowed: Vec<&'static str>,
    },

    #[error("Invalid Home Assistant device_class [{device_class}] for entry [{name}]: allowed values are {allowed:?}")]
    InvalidDeviceClass {
        name: String,
        device_class: String,
        allowed: Vec<&'static str>,
    },

    #[error("Invalid setting {0}: must be greater than zero")]
    ZeroPeriod(&'static str),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub mqtt_broker: MqttConfig,
    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,
    #[serde(default = "default_log_stats_every")]
    pub log_stats_every: u64,
    #[serde(default)]
    pub i2c_optoisolated_inputs: Vec<OptoInputConfig>,
    #[serde(default)]
    pub gpio_inputs: Vec<GpioInputConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,

    #[serde(skip)]
    pub disable_hw: bool,
    #[serde(skip)]
    pub verbose: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HomeAssistantConfig {
    #[serde(default = "default_topic_prefix")]
    pub default_topic_prefix: String,
    #[serde(default = "default_publish_period_msec")]
    pub publish_period_msec: u64,
    #[serde(default)]
    pub discovery_messages: DiscoveryConfig,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            default_topic_prefix: default_topic_prefix(),
            publish_period_msec: default_publish_period_msec(),
            discovery_messages: DiscoveryConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_discovery_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            topic_prefix: default_discovery_topic_prefix(),
            node_id: None,
        }
    }
}

/// MQTT bindings of entities with an on/off pair
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OnOffMqttConfig {
    pub topic: Option<String>,
    /// Only meaningful for outputs
    pub state_topic: Option<String>,
    pub payload_on: Option<String>,
    pub payload_off: Option<String>,
}

/// MQTT bindings of edge-triggered GPIO inputs
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EdgeMqttConfig {
    pub topic: Option<String>,
    pub payload: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HomeAssistantEntityConfig {
    pub device_class: String,
    pub platform: Option<String>,
    pub expire_after: Option<u64>,
    pub icon: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// 0 disables filtering
    #[serde(default)]
    pub stability_threshold_sec: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OptoInputConfig {
    pub name: String,
    pub description: Option<String>,
    pub input_num: u8,
    pub active_low: bool,
    #[serde(default)]
    pub mqtt: OnOffMqttConfig,
    pub home_assistant: HomeAssistantEntityConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GpioInputConfig {
    pub name: String,
    pub description: Option<String>,
    pub gpio: u8,
    pub active_low: bool,
    pub mqtt: EdgeMqttConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub name: String,
    pub description: Option<String>,
    pub gpio: u8,
    pub active_low: bool,
    #[serde(default)]
    pub mqtt: OnOffMqttConfig,
    pub home_assistant: HomeAssistantEntityConfig,
}

fn default_log_stats_every() -> u64 {
    DEFAULT_STATS_LOG_PERIOD_SEC
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_discovery_topic_prefix() -> String {
    DEFAULT_DISCOVERY_TOPIC_PREFIX.to_string()
}

fn default_publish_period_msec() -> u64 {
    DEFAULT_PUBLISH_PERIOD_MSEC
}

fn default_true() -> bool {
    true
}

/// Global settings consumed by the runtime components
#[derive(Clone, Debug, PartialEq)]
pub struct CoreSettings {
    pub publish_period: Duration,
    /// Zero disables the periodic statistics report
    pub log_stats_every: Duration,
    pub discovery_enabled: bool,
    pub discovery_topic_prefix: String,
    pub node_id: String,
}

impl CoreSettings {
    /// Sampling runs ten times faster than publishing to keep debounce latency low
    pub fn sample_period(&self) -> Duration {
        (self.publish_period / 10).max(Duration::from_millis(1))
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration file {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Successfully loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        debug!(
            "Loaded {} opto-isolated inputs, {} GPIO inputs, {} outputs",
            config.i2c_optoisolated_inputs.len(),
            config.gpio_inputs.len(),
            config.outputs.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.home_assistant.publish_period_msec == 0 {
            return Err(ConfigError::ZeroPeriod("home_assistant.publish_period_msec"));
        }
        if self.mqtt_broker.reconnection_period_msec == 0 {
            return Err(ConfigError::ZeroPeriod("mqtt_broker.reconnection_period_msec"));
        }

        let mut names = HashSet::new();
        let mut check_name = |name: &str| -> Result<(), ConfigError> {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid {
                return Err(ConfigError::InvalidName(name.to_string()));
            }
            if !names.insert(name.to_string()) {
                return Err(ConfigError::DuplicateName(name.to_string()));
            }
            Ok(())
        };

        let mut input_nums = HashSet::new();
        for input in &self.i2c_optoisolated_inputs {
            check_name(&input.name)?;
            if input.input_num == 0 || input.input_num > seq_micro_hat::MAX_CHANNELS {
                return Err(ConfigError::InvalidInputNum {
                    name: input.name.clone(),
                    input_num: input.input_num,
                    reason: format!(
                        "the legal range is [1-{}]",
                        seq_micro_hat::MAX_CHANNELS
                    ),
                });
            }
            if !input_nums.insert(input.input_num) {
                return Err(ConfigError::InvalidInputNum {
                    name: input.name.clone(),
                    input_num: input.input_num,
                    reason: "already used by another input".to_string(),
                });
            }
            let platform = input
                .home_assistant
                .platform
                .as_deref()
                .unwrap_or(PLATFORM_BINARY_SENSOR);
            check_platform(&input.name, platform, &[PLATFORM_BINARY_SENSOR])?;
            check_device_class(&input.name, platform, &input.home_assistant.device_class)?;
        }

        let mut input_gpios = HashSet::new();
        for input in &self.gpio_inputs {
            check_name(&input.name)?;
            check_gpio(&input.name, input.gpio)?;
            if !input_gpios.insert(input.gpio) {
                return Err(ConfigError::InvalidGpio {
                    name: input.name.clone(),
                    gpio: input.gpio,
                    reason: "already used by another GPIO input".to_string(),
                });
            }
        }

        let mut output_gpios = HashSet::new();
        let mut output_topics = HashSet::new();
        for output in &self.outputs {
            check_name(&output.name)?;
            check_gpio(&output.name, output.gpio)?;
            if input_gpios.contains(&output.gpio) || !output_gpios.insert(output.gpio) {
                return Err(ConfigError::InvalidGpio {
                    name: output.name.clone(),
                    gpio: output.gpio,
                    reason: "already used by another entity".to_string(),
                });
            }
            let topic = self.command_topic_of(output);
            if !output_topics.insert(topic.clone()) {
                return Err(ConfigError::DuplicateTopic {
                    name: output.name.clone(),
                    topic,
                });
            }
            let platform = output
                .home_assistant
                .platform
                .as_deref()
                .unwrap_or(PLATFORM_SWITCH);
            check_platform(&output.name, platform, &[PLATFORM_SWITCH, PLATFORM_BUTTON])?;
            check_device_class(&output.name, platform, &output.home_assistant.device_class)?;
        }

        Ok(())
    }

    fn command_topic_of(&self, output: &OutputConfig) -> String {
        output
            .mqtt
            .topic
            .clone()
            .unwrap_or_else(|| self.default_topic(&output.name))
    }

    /// `<default_topic_prefix>/<name>`
    pub fn default_topic(&self, name: &str) -> String {
        format!("{}/{}", self.home_assistant.default_topic_prefix, name)
    }

    pub fn merge_cli_options(&mut self, disable_hw: bool, verbose: bool) {
        self.disable_hw |= disable_hw;
        self.verbose |= verbose;
    }

    /// Applies `DISABLE_HW`, `VERBOSE`, `MQTT_BROKER_HOST` and `MQTT_BROKER_PORT`.
    pub fn merge_env_vars(&mut self) {
        self.merge_vars(|key| std::env::var(key).ok());
    }

    fn merge_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if lookup("DISABLE_HW").is_some() {
            self.disable_hw = true;
        }
        if lookup("VERBOSE").is_some() {
            self.verbose = true;
        }
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            self.mqtt_broker.host = host;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt_broker.port = port,
                Err(e) => tracing::warn!("Ignoring MQTT_BROKER_PORT={}: {}", port, e),
            }
        }
    }

    /// Discovery node id, defaulting to the host name
    pub fn node_id(&self) -> String {
        self.home_assistant
            .discovery_messages
            .node_id
            .clone()
            .unwrap_or_else(current_hostname)
    }

    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            publish_period: Duration::from_millis(self.home_assistant.publish_period_msec),
            log_stats_every: Duration::from_secs(self.log_stats_every),
            discovery_enabled: self.home_assistant.discovery_messages.enable,
            discovery_topic_prefix: self.home_assistant.discovery_messages.topic_prefix.clone(),
            node_id: self.node_id(),
        }
    }

    pub fn log_summary(&self) {
        info!("Config summary:");
        info!(
            "** MQTT broker {}:{} (authentication {}), reconnection period {}ms",
            self.mqtt_broker.host,
            self.mqtt_broker.port,
            if self.mqtt_broker.has_credentials() { "ON" } else { "OFF" },
            self.mqtt_broker.reconnection_period_msec
        );
        info!(
            "** HomeAssistant publish period {}ms, discovery messages {}, node id {}",
            self.home_assistant.publish_period_msec,
            self.home_assistant.discovery_messages.enable,
            self.node_id()
        );
        for input in &self.i2c_optoisolated_inputs {
            info!("** opto-isolated input#{}: {}", input.input_num, input.name);
        }
        for input in &self.gpio_inputs {
            info!("** GPIO input#{}: {}", input.gpio, input.name);
        }
        for (idx, output) in self.outputs.iter().enumerate() {
            info!("** output#{}: {} (GPIO{})", idx + 1, output.name, output.gpio);
        }
        info!(
            "** log stats every {}s, hardware {}",
            self.log_stats_every,
            if self.disable_hw { "DISABLED" } else { "enabled" }
        );
    }
}

fn check_gpio(name: &str, gpio: u8) -> Result<(), ConfigError> {
    if !GPIO_RANGE.contains(&gpio) {
        return Err(ConfigError::InvalidGpio {
            name: name.to_string(),
            gpio,
            reason: "the legal range is [1-40]".to_string(),
        });
    }
    if seq_micro_hat::RESERVED_GPIOS.contains(&gpio) {
        return Err(ConfigError::InvalidGpio {
            name: name.to_string(),
            gpio,
            reason: "reserved for the opto-isolated input HAT".to_string(),
        });
    }
    Ok(())
}

fn check_platform(name: &str, platform: &str, allowed: &[&'static str]) -> Result<(), ConfigError> {
    if allowed.contains(&platform) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPlatform {
            name: name.to_string(),
            platform: platform.to_string(),
            allowed: allowed.to_vec(),
        })
    }
}

fn check_device_class(name: &str, platform: &str, device_class: &str) -> Result<(), ConfigError> {
    let allowed = allowed_device_classes(platform);
    if allowed.contains(&device_class) {
        Ok(())
    } else {
        Err(ConfigError::InvalidDeviceClass {
            name: name.to_string(),
            device_class: device_class.to_string(),
            allowed: allowed.to_vec(),
        })
    }
}

fn current_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "raspberrypi".to_string())
}

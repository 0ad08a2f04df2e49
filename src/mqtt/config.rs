use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_RECONNECTION_PERIOD_MSEC: u64 = 1000;
pub const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// `[mqtt_broker]` section of the configuration file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_reconnection_period_msec")]
    pub reconnection_period_msec: u64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_reconnection_period_msec() -> u64 {
    DEFAULT_RECONNECTION_PERIOD_MSEC
}

impl MqttConfig {
    pub fn reconnection_period(&self) -> Duration {
        Duration::from_millis(self.reconnection_period_msec)
    }

    pub fn has_credentials(&self) -> bool {
        self.user.is_some()
    }
}

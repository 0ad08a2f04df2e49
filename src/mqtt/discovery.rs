//! Home Assistant MQTT discovery descriptors
//!
//! One retained JSON document per opto-isolated input and per output, on
//! `<discovery_prefix>/<platform>/<node_id>/<name>/config`. GPIO inputs are
//! plain triggers and have no Home Assistant entity.

use serde::Serialize;
use tracing::{debug, error};

use super::message_manager::OutboundMessage;
use crate::config::{MANUFACTURER, PLATFORM_BUTTON, THIS_APP_NAME};
use crate::registry::{EntityRegistry, OptoInput, Output};

#[derive(Serialize, Debug)]
struct Device<'a> {
    manufacturer: &'static str,
    model: &'static str,
    name: &'a str,
    sw_version: &'static str,
    identifiers: Vec<String>,
}

#[derive(Serialize, Debug)]
struct Descriptor<'a> {
    unique_id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<&'a str>,
    state_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_press: Option<&'a str>,
    device_class: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    device: Device<'a>,
}

/// Where discovery documents go and how the device is named
#[derive(Debug, Clone)]
pub struct DiscoveryTarget {
    pub topic_prefix: String,
    pub node_id: String,
}

impl DiscoveryTarget {
    pub fn topic(&self, platform: &str, name: &str) -> String {
        format!("{}/{}/{}/{}/config", self.topic_prefix, platform, self.node_id, name)
    }

    /// Birth/last-will topic of Home Assistant itself
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }

    fn device(&self) -> Device<'_> {
        Device {
            manufacturer: MANUFACTURER,
            model: THIS_APP_NAME,
            name: &self.node_id,
            sw_version: env!("CARGO_PKG_VERSION"),
            identifiers: vec![format!("{}-{}", THIS_APP_NAME, self.node_id)],
        }
    }
}

fn opto_descriptor<'a>(input: &'a OptoInput, target: &'a DiscoveryTarget) -> Descriptor<'a> {
    Descriptor {
        unique_id: &input.name,
        name: &input.description,
        command_topic: None,
        state_topic: &input.topic,
        payload_on: Some(&input.payload_on),
        payload_off: Some(&input.payload_off),
        payload_press: None,
        device_class: &input.home_assistant.device_class,
        expire_after: input.home_assistant.expire_after,
        icon: input.home_assistant.icon.as_deref(),
        device: target.device(),
    }
}

fn output_descriptor<'a>(output: &'a Output, target: &'a DiscoveryTarget) -> Descriptor<'a> {
    let is_button = output.home_assistant.platform == PLATFORM_BUTTON;
    Descriptor {
        unique_id: &output.name,
        name: &output.description,
        command_topic: Some(&output.command_topic),
        state_topic: &output.state_topic,
        payload_on: (!is_button).then_some(output.payload_on.as_str()),
        payload_off: (!is_button).then_some(output.payload_off.as_str()),
        payload_press: is_button.then_some(output.payload_on.as_str()),
        device_class: &output.home_assistant.device_class,
        expire_after: None,
        icon: output.home_assistant.icon.as_deref(),
        device: target.device(),
    }
}

fn to_message(topic: String, descriptor: &Descriptor<'_>) -> Option<OutboundMessage> {
    match serde_json::to_string(descriptor) {
        Ok(payload) => Some(OutboundMessage::retained(topic, payload)),
        Err(e) => {
            error!("Failed to serialize discovery message for [{}]: {}", descriptor.unique_id, e);
            None
        }
    }
}

/// Discovery messages for every entity Home Assistant should know about
pub fn discovery_messages(registry: &EntityRegistry, target: &DiscoveryTarget) -> Vec<OutboundMessage> {
    let inputs = registry.opto_inputs().filter_map(|input| {
        to_message(
            target.topic(&input.home_assistant.platform, &input.name),
            &opto_descriptor(input, target),
        )
    });
    let outputs = registry.outputs().filter_map(|output| {
        to_message(
            target.topic(&output.home_assistant.platform, &output.name),
            &output_descriptor(output, target),
        )
    });

    let messages: Vec<OutboundMessage> = inputs.chain(outputs).collect();
    debug!("Prepared {} discovery messages", messages.len());
    messages
}

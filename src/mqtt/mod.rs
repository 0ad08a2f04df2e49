//! # MQTT Integration Module
//!
//! Owns the single broker session of the bridge and everything that travels
//! over it.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - [mqtt_broker] section and connection defaults
//! ├── discovery.rs        - Home Assistant discovery descriptors
//! ├── message_manager.rs  - Messages exchanged with the engine
//! └── mqtt_handler.rs     - Connection loop, routing, reconnect and drain
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Engine ──OutboundMessage──► MqttBridge ──publish──► broker
//! Engine ◄──BridgeEvent────── MqttBridge ◄─subscribe─ broker
//! ```
//!
//! Inbound publishes are routed by exact topic match: command topics of the
//! outputs become [`message_manager::BridgeEvent::Command`], the Home Assistant
//! status topic re-triggers discovery, everything else is logged and dropped.
//! Every (re)connection subscribes again, publishes discovery and notifies the
//! engine with [`message_manager::BridgeEvent::Connected`] so that retained
//! output states are refreshed.
//!
//! All publishes use QoS 1. There is no application-level acknowledgment:
//! while the broker is unreachable rumqttc buffers a bounded number of
//! requests and the periodic republish fills any remaining gap.

pub mod config;
pub mod discovery;
pub mod message_manager;
pub mod mqtt_handler;

pub use message_manager::{BridgeEvent, OutboundMessage};
pub use mqtt_handler::{BridgeError, ConnectionState, MqttBridge};

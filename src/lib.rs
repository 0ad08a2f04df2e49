//! raspy2mqtt bridges the digital inputs and outputs of a Raspberry Pi to an
//! MQTT broker so that Home Assistant can observe sensors and drive actuators
//! without any host-side configuration.
//!
//! # Architecture
//!
//! ```text
//! hardware ──► inputs (sampler, debounce) ──► engine ──► mqtt (bridge) ──► broker
//!    ▲                                          │  ▲                         │
//!    └────────────── outputs (controller) ◄─────┘  └──── commands ◄──────────┘
//! ```
//!
//! - [`config`] - TOML configuration, validation and overrides
//! - [`registry`] - resolved entities and topic bindings
//! - [`hardware`] - capability trait with Raspberry Pi and in-memory backends
//! - [`inputs`] - opto-isolated polling, GPIO edges, debounce filtering
//! - [`outputs`] - switch and button actuation
//! - [`scheduler`] - publish tick, stats tick and button pulse timers
//! - [`engine`] - the task that owns runtime state and glues everything
//! - [`mqtt`] - broker session, routing and Home Assistant discovery
//! - [`stats`] - counters reported periodically and at shutdown

pub mod config;
pub mod engine;
pub mod hardware;
pub mod inputs;
pub mod mqtt;
pub mod outputs;
pub mod registry;
pub mod scheduler;
pub mod stats;

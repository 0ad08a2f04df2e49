//! Engine task
//!
//! Single async task gluing the components together. It is the only writer of
//! output state (through [`OutputController`]) and of the mirror of confirmed
//! input levels, so per-entity publishes leave it strictly ordered.
//!
//! ```text
//! InputEvent  ──┐                         ┌──► OutboundMessage ──► MqttBridge
//! BridgeEvent ──┼──► Engine ──────────────┤
//! Scheduler   ──┘    (OutputController)   └──► Hardware (output lines)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoreSettings;
use crate::hardware::Hardware;
use crate::inputs::InputEvent;
use crate::mqtt::{BridgeEvent, OutboundMessage};
use crate::outputs::{Effect, OutputController, BUTTON_PULSE_DURATION};
use crate::registry::EntityRegistry;
use crate::scheduler::{ScheduledEvent, Scheduler};
use crate::stats::Stats;

pub struct Engine {
    registry: Arc<EntityRegistry>,
    outputs: OutputController,
    scheduler: Scheduler,
    input_levels: HashMap<String, bool>,
    inputs: mpsc::Receiver<InputEvent>,
    bridge_events: mpsc::Receiver<BridgeEvent>,
    outbound: mpsc::Sender<OutboundMessage>,
    stats: Arc<Stats>,
}

impl Engine {
    pub fn new(
        registry: Arc<EntityRegistry>,
        hardware: Arc<dyn Hardware>,
        settings: &CoreSettings,
        inputs: mpsc::Receiver<InputEvent>,
        bridge_events: mpsc::Receiver<BridgeEvent>,
        outbound: mpsc::Sender<OutboundMessage>,
        stats: Arc<Stats>,
    ) -> Self {
        let outputs = OutputController::new(hardware, registry.clone(), stats.clone());
        // confirmed levels start low until the sampler says otherwise
        let input_levels = registry
            .opto_inputs()
            .map(|input| (input.name.clone(), false))
            .collect();

        Self {
            registry,
            outputs,
            scheduler: Scheduler::new(settings.publish_period, settings.log_stats_every),
            input_levels,
            inputs,
            bridge_events,
            outbound,
            stats,
        }
    }

    /// Runs until `cancel` fires, then drives all outputs inactive. Dropping
    /// the engine closes the outbound channel, which lets the bridge drain.
    pub async fn run(mut self, cancel: CancellationToken) {
        let failures = self.outputs.initialize();
        if failures > 0 {
            warn!("{} outputs could not be driven to their inactive level", failures);
        }
        info!("Engine started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Engine shutting down");
                    break;
                }
                Some(event) = self.inputs.recv() => self.handle_input(event),
                event = self.bridge_events.recv() => match event {
                    Some(event) => self.handle_bridge_event(event),
                    None => {
                        error!("MQTT bridge is gone, stopping engine");
                        break;
                    }
                },
                due = self.scheduler.next() => self.handle_scheduled(due),
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        let pulses = self.scheduler.pending_pulses();
        if pulses > 0 {
            debug!("Cancelling {} pending button pulses", pulses);
        }
        for output in self.registry.outputs() {
            self.scheduler.disarm_pulse(&output.name);
        }
        let failures = self.outputs.release_all();
        if failures > 0 {
            error!("{} outputs could not be released", failures);
        }
        // let Home Assistant know the released outputs are off
        self.publish_output_states();
    }

    fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::OptoChanged { name, level } => {
                let Some(input) = self.registry.opto_input(&name) else {
                    warn!("Change for unknown input [{}]", name);
                    return;
                };
                info!("Input [{}] is now {}", name, input.payload(level));
                let msg = OutboundMessage::event(&input.topic, input.payload(level));
                self.input_levels.insert(name, level);
                self.publish_input(msg);
            }
            InputEvent::GpioActivated { name } => {
                let Some(input) = self.registry.gpio_input(&name) else {
                    warn!("Activation of unknown GPIO input [{}]", name);
                    return;
                };
                let msg = OutboundMessage::event(&input.topic, &input.payload);
                self.publish_input(msg);
            }
        }
    }

    fn handle_bridge_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected => {
                debug!("Broker session (re)established, refreshing states");
                self.publish_output_states();
                self.publish_input_states();
            }
            BridgeEvent::Command { output, payload } => {
                let effect = self.outputs.handle_command(&output, &payload, Instant::now());
                debug!("Command [{}] on [{}] -> {:?}", payload, output, effect);
                self.apply_effect(&output, effect);
            }
        }
    }

    fn handle_scheduled(&mut self, due: ScheduledEvent) {
        match due {
            ScheduledEvent::PublishTick => self.publish_input_states(),
            ScheduledEvent::StatsTick => self.stats.log_report(),
            ScheduledEvent::PulseExpired(name) => {
                let effect = self.outputs.release_pulse(&name, Instant::now());
                if effect == Effect::WriteFailed {
                    warn!("Retrying release of [{}] in {:?}", name, BUTTON_PULSE_DURATION);
                    self.scheduler
                        .arm_pulse(&name, Instant::now() + BUTTON_PULSE_DURATION);
                    return;
                }
                self.apply_effect(&name, effect);
            }
        }
    }

    fn apply_effect(&mut self, name: &str, effect: Effect) {
        match effect {
            Effect::Switched { level } => self.publish_output_state(name, level),
            Effect::PulseStarted { deadline } => {
                self.scheduler.arm_pulse(name, deadline);
                self.publish_output_state(name, true);
            }
            Effect::PulseExtended { deadline } => self.scheduler.arm_pulse(name, deadline),
            Effect::None | Effect::UnknownOutput | Effect::Unrecognized | Effect::WriteFailed => {}
        }
    }

    fn publish_output_state(&mut self, name: &str, level: bool) {
        let Some(output) = self.registry.output(name) else {
            return;
        };
        let msg = OutboundMessage::retained(&output.state_topic, output.payload(level));
        Stats::bump(&self.stats.output_state_publishes);
        self.publish(msg);
    }

    fn publish_output_states(&mut self) {
        let messages: Vec<OutboundMessage> = self
            .outputs
            .levels()
            .into_iter()
            .map(|(output, level)| OutboundMessage::retained(&output.state_topic, output.payload(level)))
            .collect();
        for msg in messages {
            Stats::bump(&self.stats.output_state_publishes);
            self.publish(msg);
        }
    }

    // Unconditional: keeps Home Assistant's expire_after timers from firing
    fn publish_input_states(&mut self) {
        let messages: Vec<OutboundMessage> = self
            .registry
            .opto_inputs()
            .map(|input| {
                let level = self.input_levels.get(&input.name).copied().unwrap_or(false);
                OutboundMessage::event(&input.topic, input.payload(level))
            })
            .collect();
        for msg in messages {
            self.publish_input(msg);
        }
    }

    fn publish_input(&mut self, msg: OutboundMessage) {
        Stats::bump(&self.stats.input_publishes);
        self.publish(msg);
    }

    fn publish(&mut self, msg: OutboundMessage) {
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                Stats::bump(&self.stats.messages_dropped);
                warn!("Outbound queue full, dropping {}", msg);
            }
            Err(TrySendError::Closed(msg)) => {
                debug!("Bridge gone, dropping {}", msg);
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, KEEP_ALIVE};
use super::discovery::{discovery_messages, DiscoveryTarget};
use super::message_manager::{BridgeEvent, OutboundMessage};
use crate::config::THIS_APP_NAME;
use crate::registry::EntityRegistry;
use crate::stats::Stats;

/// Requests rumqttc buffers between the bridge and the socket
const CLIENT_CAPACITY: usize = 256;
/// Upper bound on flushing queued publishes at shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Engine is no longer receiving bridge events")]
    EngineGone,
}

/// What an inbound publish means to the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command { output: String, payload: String },
    HomeAssistantOnline,
    HomeAssistantOffline,
    Unknown,
}

/// Exact-topic classification of an inbound message
pub fn classify(
    registry: &EntityRegistry,
    status_topic: Option<&str>,
    topic: &str,
    payload: &str,
) -> Inbound {
    if status_topic == Some(topic) {
        return match payload {
            "online" => Inbound::HomeAssistantOnline,
            "offline" => Inbound::HomeAssistantOffline,
            _ => Inbound::Unknown,
        };
    }
    match registry.output_by_command_topic(topic) {
        Some(output) => Inbound::Command {
            output: output.name.clone(),
            payload: payload.to_string(),
        },
        None => Inbound::Unknown,
    }
}

/// Owner of the single broker session
pub struct MqttBridge {
    config: MqttConfig,
    client_id: String,
    discovery: Option<DiscoveryTarget>,
    registry: Arc<EntityRegistry>,
    outbound: mpsc::Receiver<OutboundMessage>,
    events: mpsc::Sender<BridgeEvent>,
    stats: Arc<Stats>,
    state: ConnectionState,
    // retried on every event until the client queue takes them
    pending_subscriptions: Vec<String>,
    discovery_pending: bool,
}

impl MqttBridge {
    pub fn new(
        config: MqttConfig,
        node_id: &str,
        discovery: Option<DiscoveryTarget>,
        registry: Arc<EntityRegistry>,
        outbound: mpsc::Receiver<OutboundMessage>,
        events: mpsc::Sender<BridgeEvent>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            config,
            client_id: format!("{}-{}", THIS_APP_NAME, node_id),
            discovery,
            registry,
            outbound,
            events,
            stats,
            state: ConnectionState::default(),
            pending_subscriptions: Vec::new(),
            discovery_pending: false,
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);
        if let Some(user) = &self.config.user {
            options.set_credentials(user, self.config.password.clone().unwrap_or_default());
        }
        options
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("MQTT connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Runs until the outbound channel closes, then flushes and disconnects.
    ///
    /// Connection errors never end the loop: the session is retried every
    /// `reconnection_period_msec` for as long as the engine is alive.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Connecting to MQTT broker {}:{} as {}",
            self.config.host, self.config.port, self.client_id
        );
        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), CLIENT_CAPACITY);
        self.set_state(ConnectionState::Connecting);

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&client, event) {
                            error!("{}", e);
                            if matches!(e, BridgeError::EngineGone) {
                                break;
                            }
                        }
                    }
                    Err(e) => self.wait_before_reconnect(&e, &cancel).await,
                },
                msg = self.outbound.recv() => match msg {
                    Some(msg) => {
                        self.publish(&client, msg);
                    }
                    None => {
                        debug!("Outbound channel closed");
                        break;
                    }
                },
            }
        }

        self.drain(&client, &mut eventloop).await;
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT bridge stopped");
    }

    async fn wait_before_reconnect(&mut self, error: &ConnectionError, cancel: &CancellationToken) {
        if self.state == ConnectionState::Connected {
            Stats::bump(&self.stats.connections_lost);
        }
        self.set_state(ConnectionState::Reconnecting);
        warn!(
            "MQTT connection error: {}; reconnecting in {}ms",
            error, self.config.reconnection_period_msec
        );
        tokio::select! {
            _ = tokio::time::sleep(self.config.reconnection_period()) => {}
            _ = cancel.cancelled() => {
                debug!("Shutdown requested while waiting to reconnect");
            }
        }
    }

    fn handle_event(&mut self, client: &AsyncClient, event: Event) -> Result<(), BridgeError> {
        if self.state == ConnectionState::Connected {
            self.retry_pending(client);
        }
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                Stats::bump(&self.stats.broker_connections);
                self.set_state(ConnectionState::Connected);
                self.on_connected(client)?;
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let payload = match std::str::from_utf8(&publish.payload) {
                    Ok(payload) => payload,
                    Err(_) => {
                        Stats::bump(&self.stats.invalid_payloads);
                        warn!("Dropping non UTF-8 payload on [{}]", publish.topic);
                        return Ok(());
                    }
                };
                let status_topic = self.discovery.as_ref().map(|d| d.status_topic());
                match classify(&self.registry, status_topic.as_deref(), &publish.topic, payload) {
                    Inbound::Command { output, payload } => {
                        debug!("Command [{}] for output [{}]", payload, output);
                        self.forward(BridgeEvent::Command { output, payload })?;
                    }
                    Inbound::HomeAssistantOnline => {
                        info!("Home Assistant is online, publishing discovery messages");
                        self.discovery_pending = !self.publish_discovery(client);
                    }
                    Inbound::HomeAssistantOffline => {
                        warn!("Home Assistant went offline");
                    }
                    Inbound::Unknown => {
                        warn!("Dropping message on unexpected topic [{}]", publish.topic);
                    }
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                debug!("Disconnect sent");
            }
            _ => {}
        }
        Ok(())
    }

    // Best effort per step, deferred subscriptions are retried by handle_event
    fn on_connected(&mut self, client: &AsyncClient) -> Result<(), BridgeError> {
        self.pending_subscriptions = self
            .registry
            .command_topics()
            .map(str::to_string)
            .collect();
        if let Some(discovery) = &self.discovery {
            self.pending_subscriptions.push(discovery.status_topic());
            self.discovery_pending = true;
        }
        self.retry_pending(client);
        if !self.pending_subscriptions.is_empty() {
            warn!(
                "{} subscriptions deferred until the MQTT client queue drains",
                self.pending_subscriptions.len()
            );
        }
        self.forward(BridgeEvent::Connected)
    }

    fn retry_pending(&mut self, client: &AsyncClient) {
        self.pending_subscriptions.retain(|topic| {
            match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => {
                    debug!("Subscribed to [{}]", topic);
                    false
                }
                Err(e) => {
                    debug!("Subscription to [{}] deferred: {}", topic, e);
                    true
                }
            }
        });
        // commands first, discovery once they are all in
        if self.discovery_pending && self.pending_subscriptions.is_empty() {
            self.discovery_pending = !self.publish_discovery(client);
        }
    }

    fn forward(&self, event: BridgeEvent) -> Result<(), BridgeError> {
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                Stats::bump(&self.stats.messages_dropped);
                warn!("Engine queue full, dropping {:?}", event);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(BridgeError::EngineGone),
        }
    }

    /// Returns false when at least one document did not make it to the client
    fn publish_discovery(&self, client: &AsyncClient) -> bool {
        let Some(discovery) = &self.discovery else {
            return true;
        };
        let mut sent = true;
        for msg in discovery_messages(&self.registry, discovery) {
            Stats::bump(&self.stats.discovery_messages);
            sent &= self.publish(client, msg);
        }
        sent
    }

    /// Hands `msg` to rumqttc only while a session is up. Anything produced
    /// during an outage is dropped, the engine republishes on reconnect.
    fn publish(&self, client: &AsyncClient, msg: OutboundMessage) -> bool {
        if self.state != ConnectionState::Connected {
            Stats::bump(&self.stats.messages_dropped);
            debug!("Not connected, dropping {}", msg);
            return false;
        }
        debug!("Publishing {}", msg);
        match client.try_publish(&msg.topic, QoS::AtLeastOnce, msg.retain, msg.payload) {
            Ok(()) => true,
            Err(e) => {
                Stats::bump(&self.stats.messages_dropped);
                warn!("Dropping publish on [{}]: {}", msg.topic, e);
                false
            }
        }
    }

    // Lets rumqttc flush what is queued, then says goodbye to the broker
    async fn drain(&mut self, client: &AsyncClient, eventloop: &mut EventLoop) {
        if self.state != ConnectionState::Connected {
            debug!("Not connected, nothing to drain");
            return;
        }
        if let Err(e) = client.try_disconnect() {
            warn!("Unable to request MQTT disconnect: {}", e);
            return;
        }

        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Connection closed while draining: {}", e);
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, flush).await.is_err() {
            warn!("Pending publishes not flushed within {:?}", DRAIN_TIMEOUT);
        } else {
            info!("Disconnected from MQTT broker");
        }
    }
}

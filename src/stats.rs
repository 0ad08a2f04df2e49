use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use tracing::info;

/// Process-wide counters, shared through `Arc` by every component
#[derive(Debug)]
pub struct Stats {
    started_at: DateTime<Local>,
    pub opto_readings: AtomicU64,
    pub opto_read_errors: AtomicU64,
    pub input_publishes: AtomicU64,
    pub gpio_activations: AtomicU64,
    pub commands_processed: AtomicU64,
    pub invalid_payloads: AtomicU64,
    pub output_state_publishes: AtomicU64,
    pub hardware_write_errors: AtomicU64,
    pub discovery_messages: AtomicU64,
    pub broker_connections: AtomicU64,
    pub connections_lost: AtomicU64,
    pub messages_dropped: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub opto_readings: u64,
    pub opto_read_errors: u64,
    pub input_publishes: u64,
    pub gpio_activations: u64,
    pub commands_processed: u64,
    pub invalid_payloads: u64,
    pub output_state_publishes: u64,
    pub hardware_write_errors: u64,
    pub discovery_messages: u64,
    pub broker_connections: u64,
    pub connections_lost: u64,
    pub messages_dropped: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Local::now(),
            opto_readings: AtomicU64::new(0),
            opto_read_errors: AtomicU64::new(0),
            input_publishes: AtomicU64::new(0),
            gpio_activations: AtomicU64::new(0),
            commands_processed: AtomicU64::new(0),
            invalid_payloads: AtomicU64::new(0),
            output_state_publishes: AtomicU64::new(0),
            hardware_write_errors: AtomicU64::new(0),
            discovery_messages: AtomicU64::new(0),
            broker_connections: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            opto_readings: get(&self.opto_readings),
            opto_read_errors: get(&self.opto_read_errors),
            input_publishes: get(&self.input_publishes),
            gpio_activations: get(&self.gpio_activations),
            commands_processed: get(&self.commands_processed),
            invalid_payloads: get(&self.invalid_payloads),
            output_state_publishes: get(&self.output_state_publishes),
            hardware_write_errors: get(&self.hardware_write_errors),
            discovery_messages: get(&self.discovery_messages),
            broker_connections: get(&self.broker_connections),
            connections_lost: get(&self.connections_lost),
            messages_dropped: get(&self.messages_dropped),
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Local::now() - self.started_at
    }

    pub fn log_report(&self) {
        let s = self.snapshot();
        let uptime = self.uptime();
        info!(
            "Stats after {}h{:02}m{:02}s (started {})",
            uptime.num_hours(),
            uptime.num_minutes() % 60,
            uptime.num_seconds() % 60,
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        info!(
            ">> INPUTS: {} opto readings ({} errors), {} publishes, {} GPIO activations",
            s.opto_readings, s.opto_read_errors, s.input_publishes, s.gpio_activations
        );
        info!(
            ">> OUTPUTS: {} commands ({} invalid payloads), {} state publishes, {} write errors",
            s.commands_processed, s.invalid_payloads, s.output_state_publishes, s.hardware_write_errors
        );
        info!(
            ">> MQTT: {} connections, {} lost, {} discovery messages, {} dropped messages",
            s.broker_connections, s.connections_lost, s.discovery_messages, s.messages_dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let stats = Stats::new();
        Stats::bump(&stats.opto_readings);
        Stats::bump(&stats.opto_readings);
        Stats::bump(&stats.messages_dropped);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.opto_readings, 2);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.commands_processed, 0);
    }
}

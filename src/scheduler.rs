//! Time-based triggers of the engine
//!
//! The scheduler never touches hardware or the broker: it only tells the engine
//! *when* something is due. Three sources are multiplexed by [`Scheduler::next`]:
//! the publish tick, the optional statistics tick and one timer per active
//! button pulse.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledEvent {
    /// Republish every input state
    PublishTick,
    /// Log the statistics report
    StatsTick,
    /// The pulse of this button output is over
    PulseExpired(String),
}

#[derive(Debug)]
pub struct Scheduler {
    publish: Interval,
    stats: Option<Interval>,
    pulses: DelayQueue<String>,
    pulse_keys: HashMap<String, delay_queue::Key>,
}

impl Scheduler {
    /// The first publish tick fires immediately. A zero `stats_period`
    /// disables the statistics tick.
    pub fn new(publish_period: Duration, stats_period: Duration) -> Self {
        let mut publish = time::interval(publish_period);
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stats = (!stats_period.is_zero()).then(|| {
            let mut interval = time::interval_at(Instant::now() + stats_period, stats_period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        Self {
            publish,
            stats,
            pulses: DelayQueue::new(),
            pulse_keys: HashMap::new(),
        }
    }

    /// Arms the pulse timer of `name`, moving it if already armed
    pub fn arm_pulse(&mut self, name: &str, deadline: Instant) {
        match self.pulse_keys.get(name) {
            Some(key) => {
                debug!("Re-arming pulse timer of [{}]", name);
                self.pulses.reset_at(key, deadline);
            }
            None => {
                let key = self.pulses.insert_at(name.to_string(), deadline);
                self.pulse_keys.insert(name.to_string(), key);
            }
        }
    }

    pub fn disarm_pulse(&mut self, name: &str) {
        if let Some(key) = self.pulse_keys.remove(name) {
            self.pulses.remove(&key);
        }
    }

    pub fn pending_pulses(&self) -> usize {
        self.pulse_keys.len()
    }

    /// Waits for the next due event
    pub async fn next(&mut self) -> ScheduledEvent {
        let Self {
            publish,
            stats,
            pulses,
            pulse_keys,
        } = self;

        tokio::select! {
            Some(expired) = poll_fn(|cx| pulses.poll_expired(cx)) => {
                let name = expired.into_inner();
                pulse_keys.remove(&name);
                ScheduledEvent::PulseExpired(name)
            }
            _ = publish.tick() => ScheduledEvent::PublishTick,
            _ = tick_optional(stats) => ScheduledEvent::StatsTick,
        }
    }
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

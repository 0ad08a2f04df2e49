use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DebounceFilter, InputEvent};
use crate::hardware::{Hardware, HardwareError};
use crate::registry::EntityRegistry;
use crate::stats::Stats;

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("Failed to set up input hardware: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Failed to spawn sampler thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Input event channel closed")]
    ChannelClosed,
}

// Per-channel sampling state
#[derive(Debug)]
struct OptoChannel {
    name: String,
    input_num: u8,
    active_low: bool,
    filter: DebounceFilter,
    // false while the current confirmed level still has to reach the engine
    delivered: bool,
}

#[state]
#[derive(Debug, Clone)]
pub enum SamplerState {
    Initializing,
    Sampling,
}

#[machine]
#[derive(Debug)]
pub struct InputSampler<S: SamplerState> {
    hardware: Arc<dyn Hardware>,
    channels: Vec<OptoChannel>,
    event_sender: mpsc::Sender<InputEvent>,
    stats: Arc<Stats>,
    sample_period: Duration,
}

impl<S: SamplerState> InputSampler<S> {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl InputSampler<Initializing> {
    pub fn create(
        hardware: Arc<dyn Hardware>,
        registry: &EntityRegistry,
        event_sender: mpsc::Sender<InputEvent>,
        stats: Arc<Stats>,
        sample_period: Duration,
        now: Instant,
    ) -> Self {
        let channels: Vec<OptoChannel> = registry
            .opto_inputs()
            .map(|input| OptoChannel {
                name: input.name.clone(),
                input_num: input.input_num,
                active_low: input.active_low,
                filter: DebounceFilter::new(input.stability_threshold, now),
                delivered: true,
            })
            .collect();
        debug!(
            "Creating InputSampler for {} opto-isolated inputs, sampling every {:?}",
            channels.len(),
            sample_period
        );

        Self::new(hardware, channels, event_sender, stats, sample_period)
    }

    /// Reads every channel once so that wiring problems show up in the log at
    /// startup, then moves to the sampling state.
    pub fn initialize(self) -> InputSampler<Sampling> {
        let inputs: Vec<u8> = self.channels.iter().map(|c| c.input_num).collect();
        let readings = self.hardware.read_channels(&inputs);
        for (channel, reading) in self.channels.iter().zip(readings) {
            match reading {
                Ok(raw) => debug!(
                    "Opto-isolated input#{} [{}] initially {}",
                    channel.input_num,
                    channel.name,
                    if raw ^ channel.active_low { "active" } else { "inactive" }
                ),
                Err(e) => warn!("Initial read of [{}] failed: {}", channel.name, e),
            }
        }
        info!(
            "InputSampler initialized with {} channels, transitioning to Sampling state",
            self.channels.len()
        );
        self.transition()
    }
}

impl InputSampler<Sampling> {
    /// Reads every channel once and forwards confirmed changes.
    ///
    /// A failing channel keeps its last confirmed level and does not prevent
    /// the others from being sampled.
    pub fn sample_once(&mut self, now: Instant) -> Result<(), SamplerError> {
        let inputs: Vec<u8> = self.channels.iter().map(|c| c.input_num).collect();
        let readings = self.hardware.read_channels(&inputs);

        for (channel, reading) in self.channels.iter_mut().zip(readings) {
            match reading {
                Ok(raw) => {
                    Stats::bump(&self.stats.opto_readings);
                    if let Some(level) = channel.filter.observe(raw ^ channel.active_low, now) {
                        debug!("Input [{}] confirmed {}", channel.name, level);
                        channel.delivered = false;
                    }
                }
                Err(e) => {
                    Stats::bump(&self.stats.opto_read_errors);
                    warn!("{}; keeping last confirmed level of [{}]", e, channel.name);
                }
            }

            if channel.delivered {
                continue;
            }
            let event = InputEvent::OptoChanged {
                name: channel.name.clone(),
                level: channel.filter.confirmed(),
            };
            match self.event_sender.try_send(event) {
                Ok(()) => channel.delivered = true,
                Err(TrySendError::Full(_)) => {
                    Stats::bump(&self.stats.messages_dropped);
                    warn!("Input event queue full, retrying [{}] on next sample", channel.name);
                }
                Err(TrySendError::Closed(_)) => return Err(SamplerError::ChannelClosed),
            }
        }
        Ok(())
    }

    /// Blocking sampling loop, returns once `cancel` fires or the engine is gone
    pub fn run_sampling_loop(&mut self, cancel: CancellationToken) {
        info!("Starting InputSampler loop");
        let mut next_sample = Instant::now();

        while !cancel.is_cancelled() {
            if let Err(e) = self.sample_once(Instant::now()) {
                error!("InputSampler stopping: {}", e);
                return;
            }
            next_sample += self.sample_period;
            let now = Instant::now();
            if next_sample < now {
                // fell behind (slow bus): do not try to catch up
                next_sample = now;
            }
            std::thread::sleep(next_sample - now);
        }
        info!("InputSampler loop cancelled");
    }
}

/// Turns edge notifications of one GPIO input into single activations
#[derive(Debug, Clone)]
pub struct GpioTrigger {
    active_low: bool,
    filter: DebounceFilter,
}

impl GpioTrigger {
    pub fn new(active_low: bool, now: Instant) -> Self {
        Self {
            active_low,
            filter: DebounceFilter::new(Duration::ZERO, now),
        }
    }

    /// Feeds the electrical level seen after an edge. True only on an
    /// inactive to active transition.
    pub fn on_edge(&mut self, level: bool, now: Instant) -> bool {
        matches!(self.filter.observe(level ^ self.active_low, now), Some(true))
    }
}

/// Registers edge callbacks for every GPIO input of the registry
pub fn attach_gpio_inputs(
    hardware: &dyn Hardware,
    registry: &EntityRegistry,
    event_sender: &mpsc::Sender<InputEvent>,
    stats: &Arc<Stats>,
) -> Result<usize, SamplerError> {
    let mut attached = 0;
    for input in registry.gpio_inputs() {
        let mut trigger = GpioTrigger::new(input.active_low, Instant::now());
        let name = input.name.clone();
        let sender = event_sender.clone();
        let stats = stats.clone();

        hardware.watch_edges(
            input.gpio,
            Box::new(move |level| {
                if !trigger.on_edge(level, Instant::now()) {
                    return;
                }
                Stats::bump(&stats.gpio_activations);
                info!("GPIO input [{}] activated", name);
                if let Err(e) = sender.try_send(InputEvent::GpioActivated { name: name.clone() }) {
                    Stats::bump(&stats.messages_dropped);
                    warn!("Dropping activation of [{}]: {}", name, e);
                }
            }),
        )?;
        debug!("Attached GPIO{} to input [{}]", input.gpio, input.name);
        attached += 1;
    }
    Ok(attached)
}

/// Owns the sampler thread
pub struct SamplerHandle {
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Wires GPIO inputs and, if any opto-isolated input is configured, starts
    /// the `input-sampler` thread.
    pub fn spawn(
        hardware: Arc<dyn Hardware>,
        registry: &EntityRegistry,
        event_sender: mpsc::Sender<InputEvent>,
        stats: Arc<Stats>,
        sample_period: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, SamplerError> {
        let attached = attach_gpio_inputs(hardware.as_ref(), registry, &event_sender, &stats)?;
        info!("Watching {} GPIO inputs", attached);

        let sampler = InputSampler::create(
            hardware,
            registry,
            event_sender,
            stats,
            sample_period,
            Instant::now(),
        );
        if sampler.channel_count() == 0 {
            info!("No opto-isolated inputs configured, sampler thread not started");
            return Ok(Self { thread: None });
        }

        let thread = std::thread::Builder::new()
            .name("input-sampler".to_string())
            .spawn(move || {
                let mut sampling = sampler.initialize();
                sampling.run_sampling_loop(cancel);
            })?;
        debug!("Sampler thread spawned: {:?}", thread.thread().id());

        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Waits for the sampler thread. Only returns promptly after cancellation.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Sampler thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::hardware::{EdgeCallback, FakeHardware, HardwareError};
    use crate::registry::{Entity, GpioInput, HaMetadata, OptoInput};

    // answers every pass from one register, bit n = channel n + 1
    #[derive(Debug, Default)]
    struct PortBoard {
        port: Mutex<u16>,
        passes: AtomicUsize,
    }

    impl Hardware for PortBoard {
        fn read_channel(&self, channel: u8) -> Result<bool, HardwareError> {
            Err(HardwareError::Read {
                channel,
                reason: "single channel read".to_string(),
            })
        }

        fn read_channels(&self, channels: &[u8]) -> Vec<Result<bool, HardwareError>> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            let port = *self.port.lock().unwrap();
            channels
                .iter()
                .map(|&channel| Ok(port & (1 << (channel - 1)) != 0))
                .collect()
        }

        fn write_line(&self, line: u8, _level: bool) -> Result<(), HardwareError> {
            Err(HardwareError::Write {
                line,
                reason: "no outputs".to_string(),
            })
        }

        fn watch_edges(&self, line: u8, _callback: EdgeCallback) -> Result<(), HardwareError> {
            Err(HardwareError::Init(format!("GPIO{} not wired", line)))
        }
    }

    fn opto(name: &str, input_num: u8, active_low: bool, threshold: Duration) -> Entity {
        Entity::OptoIsolated(OptoInput {
            name: name.to_string(),
            description: name.to_string(),
            input_num,
            active_low,
            stability_threshold: threshold,
            topic: format!("rpi2home-assistant/{}", name),
            payload_on: "ON".to_string(),
            payload_off: "OFF".to_string(),
            home_assistant: HaMetadata {
                platform: "binary_sensor".to_string(),
                device_class: "door".to_string(),
                icon: None,
                expire_after: Some(30),
            },
        })
    }

    fn gpio(name: &str, line: u8, active_low: bool) -> Entity {
        Entity::Gpio(GpioInput {
            name: name.to_string(),
            description: name.to_string(),
            gpio: line,
            active_low,
            topic: format!("rpi2home-assistant/{}", name),
            payload: "PRESSED".to_string(),
        })
    }

    fn sampler(
        hw: &Arc<FakeHardware>,
        entities: Vec<Entity>,
        capacity: usize,
        t0: Instant,
    ) -> (InputSampler<Sampling>, mpsc::Receiver<InputEvent>) {
        let registry = EntityRegistry::new(entities).unwrap();
        let (tx, rx) = mpsc::channel(capacity);
        let hardware: Arc<dyn Hardware> = hw.clone();
        let sampler = InputSampler::create(
            hardware,
            &registry,
            tx,
            Arc::new(Stats::new()),
            Duration::from_millis(100),
            t0,
        );
        (sampler.initialize(), rx)
    }

    fn changed(name: &str, level: bool) -> InputEvent {
        InputEvent::OptoChanged {
            name: name.to_string(),
            level,
        }
    }

    #[test]
    fn sustained_level_is_forwarded_once() {
        let hw = Arc::new(FakeHardware::new());
        let t0 = Instant::now();
        let (mut sampler, mut rx) =
            sampler(&hw, vec![opto("door", 1, false, Duration::from_secs(1))], 8, t0);

        hw.set_channel(1, true);
        for ms in (0..=3_000u64).step_by(100) {
            sampler.sample_once(t0 + Duration::from_millis(ms)).unwrap();
        }

        assert_eq!(rx.try_recv().unwrap(), changed("door", true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn active_low_inputs_are_inverted() {
        let hw = Arc::new(FakeHardware::new());
        let t0 = Instant::now();
        let (mut sampler, mut rx) = sampler(&hw, vec![opto("door", 1, true, Duration::ZERO)], 8, t0);

        // electrically low means active
        hw.set_channel(1, false);
        sampler.sample_once(t0).unwrap();
        assert_eq!(rx.try_recv().unwrap(), changed("door", true));

        hw.set_channel(1, true);
        sampler.sample_once(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), changed("door", false));
    }

    #[test]
    fn every_pass_reads_all_channels_in_one_snapshot() {
        let board = Arc::new(PortBoard::default());
        *board.port.lock().unwrap() = 0b101;
        let registry = EntityRegistry::new(vec![
            opto("a", 1, false, Duration::ZERO),
            opto("b", 2, false, Duration::ZERO),
            opto("c", 3, false, Duration::ZERO),
        ])
        .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let hardware: Arc<dyn Hardware> = board.clone();
        let t0 = Instant::now();
        let mut sampler = InputSampler::create(
            hardware,
            &registry,
            tx,
            Arc::new(Stats::new()),
            Duration::from_millis(100),
            t0,
        )
        .initialize();

        sampler.sample_once(t0).unwrap();
        sampler.sample_once(t0 + Duration::from_millis(100)).unwrap();

        // initialize + two samples
        assert_eq!(board.passes.load(Ordering::SeqCst), 3);
        assert_eq!(rx.try_recv().unwrap(), changed("a", true));
        assert_eq!(rx.try_recv().unwrap(), changed("c", true));
        assert!(rx.try_recv().is_err());
        assert_eq!(sampler.stats.snapshot().opto_read_errors, 0);
        assert_eq!(sampler.stats.snapshot().opto_readings, 6);
    }

    #[test]
    fn read_error_does_not_block_other_channels() {
        let hw = Arc::new(FakeHardware::new());
        let t0 = Instant::now();
        let (mut sampler, mut rx) = sampler(
            &hw,
            vec![
                opto("first", 1, false, Duration::ZERO),
                opto("second", 2, false, Duration::ZERO),
            ],
            8,
            t0,
        );

        hw.set_channel(1, true);
        sampler.sample_once(t0).unwrap();
        assert_eq!(rx.try_recv().unwrap(), changed("first", true));

        hw.fail_channel(1, true);
        hw.set_channel(1, false);
        hw.set_channel(2, true);
        sampler.sample_once(t0 + Duration::from_millis(100)).unwrap();

        assert_eq!(rx.try_recv().unwrap(), changed("second", true));
        assert!(rx.try_recv().is_err());
        assert_eq!(sampler.stats.snapshot().opto_read_errors, 1);
    }

    #[test]
    fn full_queue_is_retried_on_next_sample() {
        let hw = Arc::new(FakeHardware::new());
        let t0 = Instant::now();
        let (mut sampler, mut rx) = sampler(&hw, vec![opto("door", 1, false, Duration::ZERO)], 1, t0);
        sampler
            .event_sender
            .try_send(changed("filler", false))
            .unwrap();

        hw.set_channel(1, true);
        sampler.sample_once(t0).unwrap();
        assert_eq!(rx.try_recv().unwrap(), changed("filler", false));
        assert!(rx.try_recv().is_err());

        sampler.sample_once(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), changed("door", true));
        assert_eq!(sampler.stats.snapshot().messages_dropped, 1);
    }

    #[test]
    fn closed_queue_stops_sampling() {
        let hw = Arc::new(FakeHardware::new());
        let t0 = Instant::now();
        let (mut sampler, rx) = sampler(&hw, vec![opto("door", 1, false, Duration::ZERO)], 1, t0);
        drop(rx);

        hw.set_channel(1, true);
        assert!(matches!(
            sampler.sample_once(t0),
            Err(SamplerError::ChannelClosed)
        ));
    }

    #[test]
    fn gpio_trigger_fires_once_per_activation() {
        let t0 = Instant::now();
        let mut trigger = GpioTrigger::new(false, t0);

        let fired: Vec<bool> = [true, true, true, false, false, true]
            .into_iter()
            .map(|level| trigger.on_edge(level, t0))
            .collect();

        assert_eq!(fired, vec![true, false, false, false, false, true]);
    }

    #[test]
    fn active_low_gpio_triggers_on_falling_edge() {
        let t0 = Instant::now();
        let mut trigger = GpioTrigger::new(true, t0);

        assert!(!trigger.on_edge(true, t0));
        assert!(trigger.on_edge(false, t0));
        assert!(!trigger.on_edge(true, t0));
    }

    #[test]
    fn attached_gpio_inputs_emit_activations() {
        let hw = FakeHardware::new();
        let registry = EntityRegistry::new(vec![gpio("doorbell", 17, false)]).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let stats = Arc::new(Stats::new());

        assert_eq!(attach_gpio_inputs(&hw, &registry, &tx, &stats).unwrap(), 1);
        assert!(hw.is_watched(17));

        hw.trigger_edge(17, true);
        hw.trigger_edge(17, true);
        hw.trigger_edge(17, false);

        assert_eq!(
            rx.try_recv().unwrap(),
            InputEvent::GpioActivated {
                name: "doorbell".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().gpio_activations, 1);
    }

    #[test]
    fn spawned_sampler_stops_on_cancel() {
        let hw = Arc::new(FakeHardware::new());
        hw.set_channel(1, true);
        let registry =
            EntityRegistry::new(vec![opto("door", 1, false, Duration::ZERO)]).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = SamplerHandle::spawn(
            hw,
            &registry,
            tx,
            Arc::new(Stats::new()),
            Duration::from_millis(5),
            cancel.clone(),
        )
        .unwrap();

        let event = rx.blocking_recv().unwrap();
        assert_eq!(event, changed("door", true));

        cancel.cancel();
        handle.join();
    }
}

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use raspy2mqtt::config::{AppConfig, CoreSettings, CONFIG_FILE, INTEGRATION_TESTS_OUTPUT_FILE};
use raspy2mqtt::engine::Engine;
use raspy2mqtt::hardware::{FakeHardware, Hardware, RpiHardware};
use raspy2mqtt::inputs::SamplerHandle;
use raspy2mqtt::mqtt::discovery::DiscoveryTarget;
use raspy2mqtt::mqtt::MqttBridge;
use raspy2mqtt::outputs::OutputController;
use raspy2mqtt::registry::EntityRegistry;
use raspy2mqtt::stats::Stats;

const INPUT_QUEUE_CAPACITY: usize = 256;
const BRIDGE_QUEUE_CAPACITY: usize = 64;
const OUTBOUND_QUEUE_CAPACITY: usize = 512;
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Raspberry Pi inputs and outputs to Home Assistant over MQTT
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Run against in-memory hardware, outputs are logged to a file
    #[arg(short, long)]
    disable_hw: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose || std::env::var("VERBOSE").is_ok())?;
    info!("{} v{} starting", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&cli.config)?;
    config.merge_cli_options(cli.disable_hw, cli.verbose);
    config.merge_env_vars();
    config.log_summary();

    let registry = Arc::new(EntityRegistry::from_config(&config)?);
    let stats = Arc::new(Stats::new());
    let cancel = CancellationToken::new();

    let hardware: Arc<dyn Hardware> = if config.disable_hw {
        warn!(
            "Hardware disabled: outputs are logged to {}, SIGUSR1 emulates GPIO inputs",
            INTEGRATION_TESTS_OUTPUT_FILE
        );
        let fake = Arc::new(FakeHardware::with_output_log(INTEGRATION_TESTS_OUTPUT_FILE));
        spawn_input_emulation(fake.clone(), cancel.clone())?;
        fake as Arc<dyn Hardware>
    } else {
        let with_opto_hat = registry.opto_inputs().next().is_some();
        Arc::new(RpiHardware::open(with_opto_hat)?)
    };

    let result = run(
        &config,
        registry.clone(),
        hardware.clone(),
        stats.clone(),
        cancel.clone(),
        wait_for_shutdown_signal(),
    )
    .await;
    cancel.cancel();

    if let Err(e) = &result {
        error!("Startup failed: {}", e);
        // the engine never took ownership of the lines
        OutputController::new(hardware.clone(), registry, stats.clone()).release_all();
    }
    hardware.release();
    stats.log_report();
    info!("Exiting");
    result
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .with_line_number(true)
        .init();
}

async fn run(
    config: &AppConfig,
    registry: Arc<EntityRegistry>,
    hardware: Arc<dyn Hardware>,
    stats: Arc<Stats>,
    cancel: CancellationToken,
    shutdown: impl Future<Output = Result<()>>,
) -> Result<()> {
    let settings: CoreSettings = config.core_settings();

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
    let (bridge_tx, bridge_rx) = mpsc::channel(BRIDGE_QUEUE_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    let sampler = SamplerHandle::spawn(
        hardware.clone(),
        &registry,
        input_tx,
        stats.clone(),
        settings.sample_period(),
        cancel.clone(),
    )?;

    let engine = Engine::new(
        registry.clone(),
        hardware,
        &settings,
        input_rx,
        bridge_rx,
        outbound_tx,
        stats.clone(),
    );
    let discovery = settings.discovery_enabled.then(|| DiscoveryTarget {
        topic_prefix: settings.discovery_topic_prefix.clone(),
        node_id: settings.node_id.clone(),
    });
    let bridge = MqttBridge::new(
        config.mqtt_broker.clone(),
        &settings.node_id,
        discovery,
        registry,
        outbound_rx,
        bridge_tx,
        stats,
    );

    let mut engine_task = tokio::spawn(engine.run(cancel.clone()));
    let mut bridge_task = tokio::spawn(bridge.run(cancel.clone()));
    info!("Bridge running");

    // an error here still goes through the full stop sequence below
    let outcome = tokio::select! {
        res = shutdown => res,
        _ = &mut engine_task => {
            error!("Engine stopped unexpectedly");
            Ok(())
        }
    };
    cancel.cancel();

    if !engine_task.is_finished() {
        if let Err(e) = (&mut engine_task).await {
            error!("Engine task failed: {}", e);
        }
    }
    match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut bridge_task).await {
        Ok(Ok(())) => debug!("MQTT bridge drained"),
        Ok(Err(e)) => error!("MQTT bridge task failed: {}", e),
        Err(_) => {
            warn!("MQTT bridge did not stop within {:?}, aborting", SHUTDOWN_GRACE_PERIOD);
            bridge_task.abort();
        }
    }

    tokio::task::spawn_blocking(move || sampler.join()).await?;
    outcome
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("SIGINT received");
        }
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

fn spawn_input_emulation(fake: Arc<FakeHardware>, cancel: CancellationToken) -> Result<()> {
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = sigusr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if fake.emulate_next_activation().is_none() {
                        warn!("SIGUSR1 received but no GPIO input is configured");
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    const CONFIG: &str = r#"
        log_stats_every = 0

        [mqtt_broker]
        host = "127.0.0.1"
        port = 1

        [home_assistant.discovery_messages]
        enable = false
        node_id = "test"

        [[outputs]]
        name = "alarm_siren"
        gpio = 20
        active_low = true
        home_assistant = { device_class = "switch" }
    "#;

    #[tokio::test]
    async fn failed_shutdown_wait_still_stops_every_task() {
        let config = AppConfig::from_toml_str(CONFIG).unwrap();
        let registry = Arc::new(EntityRegistry::from_config(&config).unwrap());
        let fake = Arc::new(FakeHardware::new());
        let hardware: Arc<dyn Hardware> = fake.clone();
        let cancel = CancellationToken::new();

        let result = run(
            &config,
            registry,
            hardware,
            Arc::new(Stats::new()),
            cancel.clone(),
            async { Err(eyre!("signal handlers unavailable")) },
        )
        .await;

        assert!(result.is_err());
        assert!(cancel.is_cancelled());
        // driven inactive at startup, released again by the engine before run returned
        assert_eq!(fake.writes(), vec![(20, true), (20, true)]);
    }
}

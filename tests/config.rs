use std::path::Path;

use raspy2mqtt::config::AppConfig;
use raspy2mqtt::registry::{ActuationMode, EntityRegistry};

fn sample_config() -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("dist/rpi2home-assistant.toml");
    AppConfig::load(path).unwrap()
}

#[test]
fn sample_config_is_valid() {
    let config = sample_config();

    assert_eq!(config.mqtt_broker.host, "192.168.1.5");
    assert_eq!(config.i2c_optoisolated_inputs.len(), 2);
    assert_eq!(config.gpio_inputs.len(), 1);
    assert_eq!(config.outputs.len(), 2);
}

#[test]
fn sample_config_builds_registry() {
    let registry = EntityRegistry::from_config(&sample_config()).unwrap();

    let window = registry.opto_input("opto_input_2").unwrap();
    assert_eq!(window.topic, "home/garage/window");
    assert_eq!(window.payload(true), "OPEN");

    let gate = registry.output("gate_opener").unwrap();
    assert_eq!(gate.mode, ActuationMode::Button);
    assert_eq!(gate.payload_on, "PRESS");
    assert_eq!(gate.state_topic, "rpi2home-assistant/gate_opener/state");
    assert_eq!(
        registry
            .output_by_command_topic("rpi2home-assistant/gate_opener")
            .map(|o| o.name.as_str()),
        Some("gate_opener")
    );
}

#[test]
fn cli_flags_only_enable() {
    let mut config = sample_config();
    config.merge_cli_options(true, false);
    config.merge_cli_options(false, false);

    assert!(config.disable_hw);
    assert!(!config.verbose);
}

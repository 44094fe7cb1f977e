//! Loading configuration files from disk.

use rust_hwctl::adapters::TransportKind;
use rust_hwctl::config::AppConfig;
use rust_hwctl::error::HwError;
use rust_hwctl::instrument::Instrument;
use rust_hwctl::logging::OutputFormat;
use std::io::Write;

fn temp_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_sample_config_builds_every_instrument() {
    let config = AppConfig::load_from("config/hwctl.toml").unwrap();
    config.validate().unwrap();
    assert_eq!(config.application.log_format, OutputFormat::Compact);
    assert_eq!(config.remote.handshake_port, 5555);

    let kinds: Vec<(String, TransportKind)> = config
        .instruments
        .iter()
        .map(|definition| {
            let instrument = Instrument::from_definition(definition).unwrap();
            (definition.name.clone(), instrument.settings().kind)
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("PSU".to_string(), TransportKind::PointToPoint),
            ("STAGE".to_string(), TransportKind::PointToPoint),
            ("PLC".to_string(), TransportKind::Modbus),
            ("SIM".to_string(), TransportKind::None),
        ]
    );
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.instruments.is_empty());
    assert_eq!(config.remote.handshake_timeout_ms, 5000);
}

#[test]
fn test_malformed_file_is_a_figment_error() {
    let file = temp_config("[remote]\nhandshake_port = \"not a port\"\n");
    let result = AppConfig::load_from(file.path());
    assert!(matches!(result, Err(HwError::Figment(_))));
}

#[test]
fn test_duplicate_names_rejected_on_validate() {
    let file = temp_config(
        r#"
[[instruments]]
name = "PSU"

[[instruments]]
name = "PSU"
dummy = true
"#,
    );
    let config = AppConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("Duplicate instrument name: PSU"));
}

#[test]
fn test_bad_parameter_definition_rejected_on_validate() {
    let file = temp_config(
        r#"
[[instruments]]
name = "PSU"

[[instruments.parameters]]
name = "OUTPUT"
read = "OUTP?"
lookup = { True = "1" }
scale = 2.0
"#,
    );
    let config = AppConfig::load_from(file.path()).unwrap();
    assert!(matches!(config.validate(), Err(HwError::Configuration(_))));
}

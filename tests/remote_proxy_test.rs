//! Exposer/Consumer pairs talking over loopback TCP.

use rust_hwctl::adapters::MockTransport;
use rust_hwctl::config::RemoteConfig;
use rust_hwctl::core::ParameterValue;
use rust_hwctl::error::HwError;
use rust_hwctl::instrument::{Instrument, ParameterSpec};
use rust_hwctl::network::{join_all, Consumer, Exposer, Join, DEFAULT_PRIORITY};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const LIMIT: Duration = Duration::from_secs(2);

fn remote_config() -> RemoteConfig {
    RemoteConfig {
        handshake_port: 0,
        loop_interval_ms: 5,
        reconnect_every: 20,
        handshake_timeout_ms: 2000,
        ..RemoteConfig::default()
    }
}

fn power_supply(wire: &MockTransport) -> Instrument {
    let mut psu = Instrument::new("PSU", "10.0.0.5:5025").with_transport(wire.clone());
    psu.set_check_commands(vec!["*IDN?".to_string()]);
    psu.add_parameter(ParameterSpec::new("VOLT").read("V?").set("V {}"))
        .unwrap();
    psu.add_parameter(ParameterSpec::new("OUTPUT").read("OUTP?").set("OUTP {}"))
        .unwrap();
    psu.add_lookup("OUTPUT", [("True", "1"), ("False", "0")])
        .unwrap();
    psu.add_command("RESET", "*RST").unwrap();
    wire.reply("*IDN?", "ACME,PSU-1");
    psu
}

async fn wait_for_writes(wire: &MockTransport, count: usize) -> Vec<String> {
    let deadline = Instant::now() + LIMIT;
    while wire.writes().len() < count && Instant::now() < deadline {
        sleep(Duration::from_millis(5)).await;
    }
    wire.writes()
}

#[tokio::test]
async fn test_consumer_learns_remote_surface() {
    let wire = MockTransport::new();
    let exposer = Exposer::bind(power_supply(&wire), &remote_config())
        .await
        .unwrap()
        .spawn();
    let address = exposer.handshake_addr().to_string();

    let mut consumer = Consumer::connect(&address, "PSU", &remote_config())
        .await
        .unwrap();
    assert_eq!(consumer.remote_name(), "PSU");

    let surface = consumer.list_parameters().await.unwrap();
    assert_eq!(surface.reads, vec!["VOLT", "OUTPUT", "ONLINE"]);
    assert_eq!(surface.sets, vec!["VOLT", "OUTPUT"]);
    assert_eq!(surface.commands, vec!["RESET"]);

    consumer.join().await.unwrap();
    exposer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_set_get_and_command() {
    let wire = MockTransport::new();
    let exposer = Exposer::bind(power_supply(&wire), &remote_config())
        .await
        .unwrap()
        .spawn();
    let mut consumer = Consumer::connect(
        &exposer.handshake_addr().to_string(),
        "PSU",
        &remote_config(),
    )
    .await
    .unwrap();

    consumer.set_value("VOLT", 5.5, DEFAULT_PRIORITY);
    consumer.set_value("OUTPUT", true, DEFAULT_PRIORITY);
    consumer.command("RESET", DEFAULT_PRIORITY);
    assert_eq!(
        wait_for_writes(&wire, 3).await,
        vec!["V 5.5", "OUTP 1", "*RST"]
    );

    wire.reply("OUTP?", "0");
    let value = consumer.get_value("OUTPUT", 0, LIMIT).await;
    assert_eq!(value, Some(ParameterValue::from("False")));

    let online = consumer.get_value("ONLINE", 0, LIMIT).await;
    assert_eq!(online.and_then(|v| v.as_bool()), Some(true));

    consumer.join().await.unwrap();
    let psu = exposer.shutdown().await.unwrap();
    assert!(!psu.is_online());
}

#[tokio::test]
async fn test_readings_can_be_polled() {
    let wire = MockTransport::new();
    let exposer = Exposer::bind(power_supply(&wire), &remote_config())
        .await
        .unwrap()
        .spawn();
    let mut consumer = Consumer::connect(
        &exposer.handshake_addr().to_string(),
        "PSU",
        &remote_config(),
    )
    .await
    .unwrap();

    wire.reply("V?", "12.000");
    consumer.request_value("VOLT", 2);
    let mut volt = None;
    let deadline = Instant::now() + LIMIT;
    while volt.is_none() && Instant::now() < deadline {
        volt = consumer
            .poll_readings(16)
            .into_iter()
            .find(|r| r.parameter == "VOLT");
        sleep(Duration::from_millis(5)).await;
    }
    let volt = volt.unwrap();
    assert_eq!(volt.instrument, "PSU");
    assert_eq!(volt.value.as_f64(), Some(12.0));

    consumer.join().await.unwrap();
    exposer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_name_mismatch_still_connects() {
    let wire = MockTransport::new();
    let exposer = Exposer::bind(power_supply(&wire), &remote_config())
        .await
        .unwrap()
        .spawn();

    let mut consumer = Consumer::connect(
        &exposer.handshake_addr().to_string(),
        "SCOPE",
        &remote_config(),
    )
    .await
    .unwrap();
    assert_eq!(consumer.name(), "SCOPE");
    assert_eq!(consumer.remote_name(), "PSU");

    consumer.command("RESET", 0);
    assert_eq!(wait_for_writes(&wire, 1).await, vec!["*RST"]);
    consumer.join().await.unwrap();
    exposer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_consumer_waits_for_stop() {
    let wire = MockTransport::new();
    let exposer = Exposer::bind(power_supply(&wire), &remote_config())
        .await
        .unwrap()
        .spawn();
    let address = exposer.handshake_addr().to_string();

    let mut first = Consumer::connect(&address, "PSU", &remote_config())
        .await
        .unwrap();
    let second = Consumer::connect(&address, "PSU", &remote_config()).await;
    assert!(matches!(second, Err(HwError::Protocol(msg)) if msg == "session already active"));

    first.join().await.unwrap();
    let mut second = Consumer::connect(&address, "PSU", &remote_config())
        .await
        .unwrap();
    second.join().await.unwrap();
    exposer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_and_local_workers_join_uniformly() {
    let wire = MockTransport::new();
    let exposer = Exposer::bind(power_supply(&wire), &remote_config())
        .await
        .unwrap()
        .spawn();
    let consumer = Consumer::connect(
        &exposer.handshake_addr().to_string(),
        "PSU",
        &remote_config(),
    )
    .await
    .unwrap();

    let mut workers: Vec<Box<dyn Join>> = vec![Box::new(consumer), Box::new(exposer)];
    join_all(&mut workers).await.unwrap();
    // A second round is a no-op for both kinds.
    join_all(&mut workers).await.unwrap();
}

#[tokio::test]
async fn test_dead_exposer_times_out() {
    let config = RemoteConfig {
        handshake_timeout_ms: 100,
        ..remote_config()
    };
    // Accepts connections but never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let _silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let result = Consumer::connect(&address, "PSU", &config).await;
    assert!(matches!(result, Err(HwError::Timeout(_))));
}

#[tokio::test]
async fn test_confirmed_set_lands_before_stop() {
    let wire = MockTransport::new();
    let mut psu = power_supply(&wire);
    psu.add_parameter(ParameterSpec::new("LIMIT").set("LIM {}"))
        .unwrap();
    let exposer = Exposer::bind(psu, &remote_config()).await.unwrap().spawn();
    let mut consumer = Consumer::connect(
        &exposer.handshake_addr().to_string(),
        "PSU",
        &remote_config(),
    )
    .await
    .unwrap();

    wire.reply("V?", "7.25");
    let echo = consumer
        .set_confirmed("VOLT", 7.25, DEFAULT_PRIORITY, LIMIT)
        .await
        .unwrap();
    assert_eq!(echo.and_then(|v| v.as_f64()), Some(7.25));

    // Set-only parameter: confirmed, but nothing to read back.
    let echo = consumer
        .set_confirmed("LIMIT", 3, DEFAULT_PRIORITY, LIMIT)
        .await
        .unwrap();
    assert_eq!(echo, None);

    // STOP right away; both writes already reached the instrument.
    consumer.join().await.unwrap();
    let writes = wire.writes();
    assert!(writes.contains(&"V 7.25".to_string()));
    assert!(writes.contains(&"LIM 3".to_string()));
    exposer.shutdown().await.unwrap();
}

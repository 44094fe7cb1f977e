//! Configured instruments talking to a fake line-based instrument over TCP.

use rust_hwctl::config::AppConfig;
use rust_hwctl::core::ParameterValue;
use rust_hwctl::instrument::{ConnectionState, Instrument};
use rust_hwctl::network::{Consumer, Exposer, Join};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Minimal power supply: `*IDN?`, `VOLT?`, `VOLT <v>`, `OUTP?`, `OUTP <0|1>`.
async fn spawn_fake_psu() -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                let mut volt = "0.000".to_string();
                let mut output = "0".to_string();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim_end_matches('\r').to_string();
                    log.lock().unwrap().push(line.clone());
                    let reply = match line.as_str() {
                        "*IDN?" => Some("ACME,PSU-1,0,1.0".to_string()),
                        "VOLT?" => Some(volt.clone()),
                        "OUTP?" => Some(output.clone()),
                        other => {
                            if let Some(v) = other.strip_prefix("VOLT ") {
                                volt = format!("{:.3}", v.parse::<f64>().unwrap_or(0.0));
                            } else if let Some(v) = other.strip_prefix("OUTP ") {
                                output = v.to_string();
                            }
                            None
                        }
                    };
                    if let Some(reply) = reply {
                        write.write_all(format!("{}\r\n", reply).as_bytes()).await.unwrap();
                    }
                }
            });
        }
    });
    (address, received)
}

fn write_config(psu_address: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[application]
name = "bench"
log_level = "debug"

[remote]
handshake_port = 0
loop_interval_ms = 5

[[instruments]]
name = "PSU"
address = "{psu_address}"
write_termination = "\n"
read_termination = "\r\n"
timeout_ms = 1000
check_commands = ["*IDN?"]

[[instruments.parameters]]
name = "VOLT"
read = "VOLT?"
set = "VOLT {{}}"
scale = 1000.0

[[instruments.parameters]]
name = "OUTPUT"
read = "OUTP?"
set = "OUTP {{}}"
lookup = {{ True = "1", False = "0" }}

[[instruments]]
name = "SIM"
dummy = true

[[instruments.parameters]]
name = "TEMP"
dummy = 21.5
"#
    )
    .unwrap();
    file
}

#[tokio::test]
async fn test_configured_instrument_over_tcp() {
    let (address, received) = spawn_fake_psu().await;
    let file = write_config(&address);
    let config = AppConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    let mut psu = Instrument::from_definition(config.instrument("PSU").unwrap()).unwrap();
    assert_eq!(psu.state(), ConnectionState::Offline);
    assert!(psu.try_connect().await);

    // Scaled: 2500 mV on our side is 2.5 V on the wire.
    psu.set_value("VOLT", 2500.0).await;
    psu.set_value("OUTPUT", true).await;
    assert_eq!(psu.get_value("VOLT").await, Some(ParameterValue::Float(2500.0)));
    assert_eq!(psu.get_value("OUTPUT").await, Some("True".into()));

    psu.close().await;
    assert!(!psu.is_online());
    let received = received.lock().unwrap().clone();
    assert_eq!(
        received,
        vec!["*IDN?", "VOLT 2.5", "OUTP 1", "VOLT?", "OUTP?"]
    );
}

#[tokio::test]
async fn test_unreachable_instrument_stays_offline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let file = write_config(&address);
    let config = AppConfig::load_from(file.path()).unwrap();
    let mut psu = Instrument::from_definition(config.instrument("PSU").unwrap()).unwrap();

    assert!(!psu.try_connect().await);
    assert_eq!(psu.get_value("VOLT").await, None);
    assert_eq!(psu.get_value("ONLINE").await, Some(ParameterValue::Bool(false)));
}

#[tokio::test]
async fn test_dummy_instrument_from_config() {
    let file = write_config("127.0.0.1:1");
    let config = AppConfig::load_from(file.path()).unwrap();
    let mut sim = Instrument::from_definition(config.instrument("SIM").unwrap()).unwrap();

    assert!(sim.is_dummy());
    assert!(sim.try_connect().await);
    assert_eq!(sim.get_value("TEMP").await, Some(ParameterValue::Float(21.5)));
}

#[tokio::test]
async fn test_configured_instrument_served_remotely() {
    let (address, received) = spawn_fake_psu().await;
    let file = write_config(&address);
    let config = AppConfig::load_from(file.path()).unwrap();
    let psu = Instrument::from_definition(config.instrument("PSU").unwrap()).unwrap();

    let exposer = Exposer::bind(psu, &config.remote).await.unwrap().spawn();
    let mut consumer = Consumer::connect(
        &exposer.handshake_addr().to_string(),
        "PSU",
        &config.remote,
    )
    .await
    .unwrap();

    consumer.set_value("VOLT", 1200, 0);
    let volt = consumer
        .get_value("VOLT", 1, Duration::from_secs(2))
        .await
        .and_then(|v| v.as_f64());
    assert_eq!(volt, Some(1200.0));

    consumer.join().await.unwrap();
    exposer.shutdown().await.unwrap();
    assert!(received.lock().unwrap().contains(&"VOLT 1.2".to_string()));
}

//! CLI Entry Point for hwctl
//!
//! Provides command-line interface for:
//! - Exposing a configured instrument on the network
//! - Inspecting and driving a remote instrument through a one-shot session
//! - Driving a configured instrument locally, without networking
//!
//! # Usage
//!
//! Serve an instrument until Ctrl-C:
//! ```bash
//! hwctl expose --config config/hwctl.toml --instrument PSU
//! ```
//!
//! Talk to it from another machine:
//! ```bash
//! hwctl list --address 10.0.0.2:5555 --name PSU
//! hwctl set --address 10.0.0.2:5555 --name PSU VOLT 5.0
//! hwctl get --address 10.0.0.2:5555 --name PSU VOLT
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_hwctl::config::{AppConfig, RemoteConfig, DEFAULT_CONFIG_PATH};
use rust_hwctl::core::ParameterValue;
use rust_hwctl::instrument::Instrument;
use rust_hwctl::logging;
use rust_hwctl::network::{Consumer, Exposer, Join, DEFAULT_PRIORITY};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "hwctl")]
#[command(about = "Instrument control with transparent remote access", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Handshake address of the exposer (host:port)
    #[arg(long)]
    address: String,

    /// Expected instrument name
    #[arg(long)]
    name: String,

    /// Handshake timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

impl RemoteArgs {
    fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            handshake_timeout_ms: self.timeout_ms,
            ..RemoteConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a configured instrument until Ctrl-C
    Expose {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Instrument to expose
        #[arg(long)]
        instrument: String,
    },

    /// Print the parameters and commands of a remote instrument
    List {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Read one parameter of a remote instrument
    Get {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Parameter name
        parameter: String,

        /// Priority of the request (0 = highest)
        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,
    },

    /// Set one parameter of a remote instrument
    Set {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Parameter name
        parameter: String,

        /// New value
        value: String,

        /// Priority of the request (0 = highest)
        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,
    },

    /// Drive a configured instrument directly
    Local {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Instrument name
        #[arg(long)]
        instrument: String,

        #[command(subcommand)]
        action: LocalAction,
    },
}

#[derive(Subcommand)]
enum LocalAction {
    /// Read a parameter
    Get { parameter: String },
    /// Set a parameter
    Set { parameter: String, value: String },
    /// Run a command
    Command { name: String },
    /// Print the parameters and commands
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Expose { config, instrument } => expose(&config, &instrument).await,
        Commands::List { remote } => list(&remote).await,
        Commands::Get {
            remote,
            parameter,
            priority,
        } => remote_get(&remote, &parameter, priority).await,
        Commands::Set {
            remote,
            parameter,
            value,
            priority,
        } => remote_set(&remote, &parameter, &value, priority).await,
        Commands::Local {
            config,
            instrument,
            action,
        } => local(&config, &instrument, action).await,
    }
}

/// Load and validate the configuration, then start logging.
fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;
    Ok(config)
}

fn build_instrument(config: &AppConfig, name: &str) -> Result<Instrument> {
    let Some(definition) = config.instrument(name) else {
        bail!("no instrument named '{}' in the configuration", name);
    };
    Ok(Instrument::from_definition(definition)?)
}

fn init_cli_logging() -> Result<()> {
    logging::init(logging::LoggingConfig::new(tracing::Level::WARN))?;
    Ok(())
}

async fn expose(path: &Path, name: &str) -> Result<()> {
    let config = load_config(path)?;
    let instrument = build_instrument(&config, name)?;

    let exposer = Exposer::bind(instrument, &config.remote).await?;
    println!(
        "Exposing {} on {} (data on {})",
        exposer.name(),
        exposer.handshake_addr(),
        exposer.publish_addr()
    );

    let (shutdown, rx) = watch::channel(false);
    let server = tokio::spawn(exposer.serve(rx));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    // Ignored if the server already stopped on its own
    let _ = shutdown.send(true);
    server.await?;
    Ok(())
}

async fn list(remote: &RemoteArgs) -> Result<()> {
    init_cli_logging()?;
    let mut consumer = Consumer::connect(&remote.address, &remote.name, &remote.remote_config()).await?;
    let parameters = consumer.list_parameters().await;
    consumer.join().await?;

    let parameters = parameters?;
    println!("Instrument: {}", consumer.remote_name());
    println!("  read:     {}", parameters.reads.join(", "));
    println!("  set:      {}", parameters.sets.join(", "));
    println!("  commands: {}", parameters.commands.join(", "));
    Ok(())
}

async fn remote_get(remote: &RemoteArgs, parameter: &str, priority: u8) -> Result<()> {
    init_cli_logging()?;
    let config = remote.remote_config();
    let mut consumer = Consumer::connect(&remote.address, &remote.name, &config).await?;
    let value = consumer
        .get_value(parameter, priority, config.handshake_timeout())
        .await;
    consumer.join().await?;

    match value {
        Some(value) => println!("{}", value),
        None => bail!("no value for '{}' from {}", parameter, consumer.remote_name()),
    }
    Ok(())
}

async fn remote_set(remote: &RemoteArgs, parameter: &str, value: &str, priority: u8) -> Result<()> {
    init_cli_logging()?;
    let config = remote.remote_config();
    let mut consumer = Consumer::connect(&remote.address, &remote.name, &config).await?;
    let confirmed = consumer
        .set_confirmed(
            parameter,
            ParameterValue::parse_wire(value),
            priority,
            config.handshake_timeout(),
        )
        .await;
    consumer.join().await?;

    if let Some(value) = confirmed.with_context(|| {
        format!("set of '{}' on {} not confirmed", parameter, consumer.remote_name())
    })? {
        println!("{}", value);
    }
    Ok(())
}

async fn local(path: &Path, name: &str, action: LocalAction) -> Result<()> {
    let config = load_config(path)?;
    let mut instrument = build_instrument(&config, name)?;

    if !instrument.try_connect().await {
        bail!("{} is offline", instrument.name());
    }
    match action {
        LocalAction::Get { parameter } => match instrument.get_value(&parameter).await {
            Some(value) => println!("{}", value),
            None => {
                instrument.close().await;
                bail!("no value for '{}'", parameter);
            }
        },
        LocalAction::Set { parameter, value } => {
            instrument
                .set_value(&parameter, ParameterValue::parse_wire(&value))
                .await;
        }
        LocalAction::Command { name } => instrument.command(&name).await,
        LocalAction::List => {
            let parameters = instrument.list_parameters();
            println!("read:     {}", parameters.reads.join(", "));
            println!("set:      {}", parameters.sets.join(", "));
            println!("commands: {}", parameters.commands.join(", "));
        }
    }
    instrument.close().await;
    Ok(())
}

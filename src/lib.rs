//! # Hardware Control Core Library
//!
//! This crate is the core library of the `hwctl` tool. It models laboratory
//! instruments as named parameters and commands on top of interchangeable wire
//! transports, and can republish any instrument across the network so that a
//! remote application drives it as if it were local.
//!
//! ## Crate Structure
//!
//! - **`core`**: the dynamically typed [`ParameterValue`](core::ParameterValue)
//!   exchanged by every other module.
//! - **`instrument`**: the [`Instrument`](instrument::Instrument) capability
//!   registry, the pre/post value-transform hooks, dummy mode and the
//!   connection state machine. `instrument::config` builds instruments from
//!   declarative definitions.
//! - **`adapters`**: the [`Transport`](adapters::Transport) trait and its
//!   connectors (point-to-point serial/VISA-style resources, raw TCP sockets,
//!   Modbus/TCP, and a scriptable mock).
//! - **`network`**: the remote proxy, an [`Exposer`](network::Exposer) that
//!   serves a local instrument and a [`Consumer`](network::Consumer) that
//!   represents it elsewhere.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`error`**: the crate-wide [`HwError`](error::HwError).

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod network;

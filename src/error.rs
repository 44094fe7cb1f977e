//! Custom error types for the application.
//!
//! This module defines the primary error type, `HwError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! describe what went wrong, from malformed parameter registrations to transport
//! and protocol failures.
//!
//! ## Error Hierarchy
//!
//! - **`Registration`**: a parameter, command, hook list or dummy return was
//!   rejected by the capability registry (reserved name, whitespace, duplicate).
//! - **`Configuration`**: semantic errors in a loaded configuration that passed
//!   parsing (duplicate instrument names, unknown log level, bad encoding).
//! - **`Figment`**: wraps errors from the `figment` loader (file or env parsing).
//! - **`Io`**: wraps `std::io::Error`, covering socket and serial port I/O.
//! - **`Transport`**: a connector failed to open, write or query.
//! - **`Timeout`**: a bounded wait elapsed (handshake replies, socket reads).
//! - **`Protocol`**: a remote peer sent something outside the message grammar.
//! - **`FeatureNotEnabled`**: functionality that was not compiled in.
//!
//! None of these ever escape `Instrument::get_value`, `set_value` or `command`:
//! the instrument boundary converts them into a log entry and an absent value.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type HwResult<T> = std::result::Result<T, HwError>;

#[derive(Error, Debug)]
pub enum HwError {
    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for HwError {
    fn from(err: figment::Error) -> Self {
        HwError::Figment(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = HwError::Registration("parameter 'ONLINE' is reserved".to_string());
        assert_eq!(
            err.to_string(),
            "Registration rejected: parameter 'ONLINE' is reserved"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = HwError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Timed out after 1.5s");
    }

    #[test]
    fn test_feature_not_enabled() {
        let err = HwError::FeatureNotEnabled("instrument_serial".into());
        assert!(err.to_string().contains("--features instrument_serial"));
    }
}

//! Custom error types for the tester.
//!
//! Each layer owns a small `thiserror` enum and `TesterError` consolidates them
//! for callers that do not care which layer failed:
//!
//! - **`InstrumentError`**: power supply faults. `Unavailable` means the bus or
//!   the address did not answer and is treated as bus-level; `Command` is a
//!   write/read failure or timeout on an open connection and only affects the
//!   model currently under test.
//! - **`SinkError`**: the result log could not be written. Never fatal for a run.
//! - **`ConfigError`**: the configuration file could not be loaded or a profile
//!   failed validation. Raised before any model starts.
//!
//! By using `#[from]`, `TesterError` can be created from the layer errors with
//! the `?` operator.

use crate::config::BusAddress;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, TesterError>;

/// Errors raised by the instrument layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    /// The bus could not be opened or the address did not respond in time.
    #[error("Instrument at {address} unavailable: {reason}")]
    Unavailable {
        /// Address that was being opened.
        address: BusAddress,
        /// Driver supplied detail.
        reason: String,
    },

    /// A command on an open connection failed or timed out.
    #[error("Instrument command '{command}' failed at {address}: {reason}")]
    Command {
        /// Address of the connection.
        address: BusAddress,
        /// SCPI command or operation name.
        command: String,
        /// Driver supplied detail.
        reason: String,
    },

    /// A live handle already exists for the address.
    #[error("Instrument at {0} already has a live handle")]
    AddressBusy(BusAddress),

    /// The driver was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl InstrumentError {
    /// Bus-level errors poison the address for the rest of a run.
    pub fn is_bus_level(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::FeatureNotEnabled(_))
    }
}

/// Errors raised while writing run results.
#[derive(Error, Debug)]
pub enum SinkError {
    /// File system failure.
    #[error("Result log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The result could not be encoded.
    #[error("Result serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file or an environment override could not be parsed.
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    /// The configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// Top-level error for the tester library.
#[derive(Error, Debug)]
pub enum TesterError {
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// See [`InstrumentError`].
    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    /// See [`SinkError`].
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The orchestrator task is gone.
    #[error("Orchestrator is not running")]
    OrchestratorStopped,
}

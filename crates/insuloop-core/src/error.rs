//! Error taxonomy for the closed loop.
//!
//! Every failure the engine can surface maps onto one of these kinds; the
//! dosing gates key their refuse/retain decisions off the variant, so new
//! failure modes must extend this enum rather than smuggle strings through.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoopError {
    /// Device I/O failed mid-command.
    #[error("communication error: {0}")]
    Communication(String),

    /// The connected device has no usable command channel.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No pump device is currently connected.
    #[error("connection error: {0}")]
    Connection(String),

    /// A required input is absent.
    #[error("missing data: {0}")]
    MissingData(String),

    /// An input exists but is older than the loop allows.
    #[error("stale data: {0}")]
    StaleData(String),
}

impl LoopError {
    /// Short machine-readable code, used in decision records.
    pub fn code(&self) -> &'static str {
        match self {
            LoopError::Communication(_) => "COMMUNICATION",
            LoopError::Configuration(_) => "CONFIGURATION",
            LoopError::Connection(_) => "CONNECTION",
            LoopError::MissingData(_) => "MISSING_DATA",
            LoopError::StaleData(_) => "STALE_DATA",
        }
    }
}

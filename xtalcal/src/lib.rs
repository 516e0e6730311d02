use thiserror::Error;

pub mod analyzer;
pub mod calibrate;
pub mod channel;
pub mod config;
pub mod railtest;
pub mod sim;
pub mod tinysa;

pub use analyzer::{Measurement, SpectrumAnalyzer, Sweep};
pub use calibrate::{run_calibration, Calibration, CalibrationFailure, FailureReason, Rollback};
pub use channel::{Channel, Connector, Link};
pub use config::{CalibrationConfig, StationConfig};
pub use railtest::Dut;

/// Oscillator trim (CTUNE) setting as the DUT reports it.
pub type TrimValue = u16;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No transport found: {0}")]
    TransportNotFound(String),
    #[error("Port busy or not accessible: {0}")]
    PortBusy(String),
    #[error("Timed out waiting for a line")]
    Timeout,
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("Serial communication failed")]
    Io(#[from] std::io::Error),
    #[error("No echo of {command:?} after {attempts} lines")]
    NoEcho { command: String, attempts: usize },
    #[error("Invalid response {response:?} to command {command:?}")]
    Mismatch { command: String, response: String },
    #[error("Missing {field} in response {response:?}")]
    Parse { field: &'static str, response: String },
    #[error("Unexpected firmware version {found:?}, wanted {expected:?}")]
    Version { expected: String, found: String },
    #[error("Trim readback {read} does not match written {written}")]
    TrimReadback { written: TrimValue, read: TrimValue },
    #[error("Instrument unavailable: {0}")]
    InstrumentUnavailable(String),
    #[error("Instrument error: {0}")]
    Instrument(String),
    #[error("Invalid config setting: {0}")]
    Invalid(String),
}

impl Error {
    /// Line reads that ran out of time, either on the wire or while resyncing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout | Error::NoEcho { .. })
    }

    /// The DUT answered, but not with what the command expects.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Error::Mismatch { .. } | Error::Parse { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

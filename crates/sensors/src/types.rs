//! Common types and traits for digitizer drivers

use std::sync::Arc;

use flim_types::RawFrame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of a digitizer driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverStatus {
    /// Driver is not initialized
    NotInitialized,
    /// Driver is initialized but not acquiring
    Stopped,
    /// Driver is actively acquiring frames
    Running,
    /// Driver encountered an error
    Error(String),
}

/// Errors that can occur in digitizer drivers
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// Hardware communication error
    #[error("Hardware error: {0}")]
    HardwareError(String),
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    /// Driver not initialized
    #[error("Driver not initialized")]
    NotInitialized,
    /// Acquisition already running
    #[error("Acquisition already running")]
    AlreadyRunning,
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),
    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::IoError(err.to_string())
    }
}

impl From<flim_types::ConfigError> for DriverError {
    fn from(err: flim_types::ConfigError) -> Self {
        DriverError::ConfigurationError(err.to_string())
    }
}

/// Receiver of the driver's acquisition callbacks.
///
/// Callbacks run on the driver's own thread and must not block: a frame is
/// only valid until `on_frame_acquired` returns.
pub trait AcquisitionSink: Send + Sync {
    /// A frame has been transferred from the hardware.
    fn on_frame_acquired(&self, frame: &RawFrame<'_>);

    /// Acquisition has ended, for whatever reason. Called exactly once per
    /// started acquisition and always last.
    fn on_acquisition_stopped(&self);

    /// Driver status text; `is_error` marks hardware failures.
    fn on_status_message(&self, text: &str, is_error: bool);
}

/// Trait that all digitizer drivers must implement
pub trait Digitizer: Send {
    /// Initialize the driver and underlying hardware.
    fn initialize(&mut self) -> Result<(), DriverError>;

    /// Start streaming frames into `sink` on the driver's thread.
    fn start(&mut self, sink: Arc<dyn AcquisitionSink>) -> Result<(), DriverError>;

    /// Stop streaming and wait for the acquisition thread to finish.
    /// Stopping an idle driver is a no-op.
    fn stop(&mut self) -> Result<(), DriverError>;

    /// Get current driver status
    fn get_status(&self) -> DriverStatus;
}

pub mod types;
pub mod mock_digitizer;

// Re-export the main types that users need
pub use types::{AcquisitionSink, Digitizer, DriverError, DriverStatus};
pub use mock_digitizer::{MockDigitizer, MockDigitizerConfig};

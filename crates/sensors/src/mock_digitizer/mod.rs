pub mod driver;
pub mod mock_data_generator;

pub use driver::{MockDigitizer, MockDigitizerConfig};
pub use mock_data_generator::{PulseGenerator, PulseShape};

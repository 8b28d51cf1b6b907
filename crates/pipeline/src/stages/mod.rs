//! The three stages of the data plane

pub mod acquire;
pub mod process;
pub mod visualize;

pub use acquire::AcquisitionFeed;
pub use process::{ProcessControl, PulseStage};
pub use visualize::ImageStage;

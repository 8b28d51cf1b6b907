//! Shared types for the FLIm acquisition pipeline
//!
//! Session configuration snapshots, the raw frame view handed over by
//! digitizer drivers, and the events the pipeline publishes.

pub mod config;
pub mod data;
pub mod event;

pub use config::*;
pub use data::*;
pub use event::*;

//! Error types for the pipeline system

use std::path::PathBuf;

use flim_types::ConfigError;
use thiserror::Error;

/// Pipeline-specific error types
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("No recording is in progress")]
    NotRecording,

    #[error("A save is already in progress")]
    SaveInProgress,

    #[error("Refusing to overwrite existing file {0:?}")]
    FileExists(PathBuf),

    #[error("Save target {0:?} would be overwritten by its own companion files")]
    CompanionCollision(PathBuf),

    #[error("Nothing has been recorded")]
    NothingRecorded,

    #[error("Runtime error in stage '{stage_name}': {message}")]
    RuntimeError { stage_name: String, message: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image encoding error: {0}")]
    ImageError(#[from] image::ImageError),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error types for a single stage in the data plane.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("queue closed")]
    QueueClosed,
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("invalid configuration: {0}")]
    BadConfig(String),
}

impl From<ConfigError> for StageError {
    fn from(err: ConfigError) -> Self {
        StageError::BadConfig(err.to_string())
    }
}

//! Real-time FLIm pulse pipeline
//!
//! Raw pulse frames from a digitizer flow through three threads: the
//! acquisition callback copies them into pooled buffers, the processing
//! stage integrates every pulse into four channel intensities, and the
//! visualization stage assembles images, publishes them as
//! [`PipelineEvent`](flim_types::PipelineEvent)s and feeds the recorder.
//! Buffers come from fixed pools allocated once per session; when a pool
//! runs dry the newest frame is dropped and counted instead of blocking the
//! hardware.

pub mod accumulator;
pub mod allocator;
pub mod data;
pub mod error;
pub mod events;
pub mod executor;
pub mod processor;
pub mod queue;
pub mod recording;
pub mod stage;
pub mod stages;
pub mod stats;


// Re-export commonly used types
pub use accumulator::{Accumulated, ImageAccumulator};
pub use allocator::{BufferPool, PooledBuffer, SharedBufferPool};
pub use error::*;
pub use events::event_channel;
pub use executor::Pipeline;
pub use processor::PulseProcessor;
pub use queue::{sync_queue, QueueReceiver, QueueSender, StopHandle, Work};
pub use recording::{CaptureResult, RecordingBuffer, SaveReport, StartOutcome, UnsavedDecision};
pub use stage::{Outlet, StageHandler, StageState, StageWorker};
pub use stages::*;
pub use stats::{DropPolicy, PipelineStats, StatsSnapshot};

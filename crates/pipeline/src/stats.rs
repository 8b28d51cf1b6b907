//! Throughput and loss counters shared by the stages.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// What happens to a frame that finds its target pool empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DropPolicy {
    /// Discard the incoming frame and keep everything already queued.
    #[default]
    DropNewest,
}

/// Lock-free counters updated from the stage threads.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_acquired: AtomicU64,
    acquisition_drops: AtomicU64,
    rejected_frames: AtomicU64,
    frames_processed: AtomicU64,
    processing_drops: AtomicU64,
    raw_copy_drops: AtomicU64,
    frames_visualized: AtomicU64,
    images_completed: AtomicU64,
    display_events_dropped: AtomicU64,
}

/// A point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Frames copied into Q1.
    pub frames_acquired: u64,
    /// Frames dropped because no raw buffer was free.
    pub acquisition_drops: u64,
    /// Frames whose size did not match the session geometry.
    pub rejected_frames: u64,
    pub frames_processed: u64,
    /// Frames dropped because no intensity buffer was free.
    pub processing_drops: u64,
    /// Frames forwarded without their raw copy.
    pub raw_copy_drops: u64,
    pub frames_visualized: u64,
    pub images_completed: u64,
    /// Display updates dropped because the host was not reading events.
    pub display_events_dropped: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    counter!(frame_acquired, frames_acquired);
    counter!(acquisition_dropped, acquisition_drops);
    counter!(frame_rejected, rejected_frames);
    counter!(frame_processed, frames_processed);
    counter!(processing_dropped, processing_drops);
    counter!(raw_copy_dropped, raw_copy_drops);
    counter!(frame_visualized, frames_visualized);
    counter!(image_completed, images_completed);
    counter!(display_event_dropped, display_events_dropped);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_acquired: self.frames_acquired.load(Ordering::Relaxed),
            acquisition_drops: self.acquisition_drops.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            processing_drops: self.processing_drops.load(Ordering::Relaxed),
            raw_copy_drops: self.raw_copy_drops.load(Ordering::Relaxed),
            frames_visualized: self.frames_visualized.load(Ordering::Relaxed),
            images_completed: self.images_completed.load(Ordering::Relaxed),
            display_events_dropped: self.display_events_dropped.load(Ordering::Relaxed),
        }
    }
}

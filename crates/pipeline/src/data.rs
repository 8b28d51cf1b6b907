//! Work items carried between stages.

use crate::allocator::PooledBuffer;

/// A raw frame copied out of the digitizer callback (queue Q1).
#[derive(Debug)]
pub struct RawPacket {
    pub frame_index: u64,
    /// `n_times * n_segments` samples, already polarity-corrected.
    pub samples: PooledBuffer<u16>,
}

/// Output of the processing stage (queue Q2).
#[derive(Debug)]
pub struct ProcessedPacket {
    pub frame_index: u64,
    /// Line-major `[pulse_lines][CHANNEL_COUNT]` intensities.
    pub intensity: PooledBuffer<f32>,
    /// Copy of the raw frame, present while raw pulses may be recorded.
    pub raw: Option<PooledBuffer<u16>>,
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CHANNEL_COUNT;

/// A raw frame as handed over by the digitizer callback.
///
/// The samples are only borrowed for the duration of the callback; the
/// pipeline copies what it needs before returning.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    /// Hardware frame counter, restarting at 0 with every acquisition.
    pub index: u64,
    /// `n_times` rows of `n_segments` unsigned samples.
    pub samples: &'a [u16],
}

impl<'a> RawFrame<'a> {
    pub fn new(index: u64, samples: &'a [u16]) -> Self {
        Self { index, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-channel intensities of every pulse in one frame, stored line-major:
/// `values[line * CHANNEL_COUNT + channel]`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntensityFrame {
    pub frame_index: u64,
    pub lines: usize,
    pub values: Arc<[f32]>,
}

impl IntensityFrame {
    pub fn get(&self, line: usize, channel: usize) -> Option<f32> {
        if channel >= CHANNEL_COUNT {
            return None;
        }
        self.values.get(line * CHANNEL_COUNT + channel).copied()
    }

    /// Iterates one channel's intensities in line order.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        self.values
            .iter()
            .skip(channel)
            .step_by(CHANNEL_COUNT)
            .copied()
            .take(if channel < CHANNEL_COUNT { self.lines } else { 0 })
    }
}

/// A finished image for all four channels, each `n_lines` rows of
/// `n_pixels` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AveragedImage {
    /// Counts finished images since the acquisition started.
    pub sequence: u64,
    pub n_pixels: usize,
    pub n_lines: usize,
    pub accumulation: usize,
    pub averaging: usize,
    pub channels: [Vec<f32>; CHANNEL_COUNT],
}

impl AveragedImage {
    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel]
    }

    pub fn pixel(&self, channel: usize, row: usize, col: usize) -> f32 {
        self.channels[channel][row * self.n_pixels + col]
    }

    pub fn row(&self, channel: usize, row: usize) -> &[f32] {
        let start = row * self.n_pixels;
        &self.channels[channel][start..start + self.n_pixels]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intensity_frame_is_line_major() {
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let frame = IntensityFrame {
            frame_index: 7,
            lines: 3,
            values: values.into(),
        };
        assert_eq!(frame.get(1, 2), Some(6.0));
        assert_eq!(frame.get(3, 0), None);
        assert_eq!(frame.get(0, 4), None);
        assert_eq!(frame.channel(1).collect::<Vec<_>>(), vec![1.0, 5.0, 9.0]);
        assert_eq!(frame.channel(4).count(), 0);
    }

    #[test]
    fn averaged_image_rows() {
        let image = AveragedImage {
            sequence: 0,
            n_pixels: 2,
            n_lines: 2,
            accumulation: 1,
            averaging: 1,
            channels: std::array::from_fn(|c| vec![c as f32, 1.0, 2.0, 3.0]),
        };
        assert_eq!(image.row(0, 1), &[2.0, 3.0]);
        assert_eq!(image.pixel(3, 0, 0), 3.0);
    }
}

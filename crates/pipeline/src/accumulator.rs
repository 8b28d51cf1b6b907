//! Builds channel images out of per-frame intensities.
//!
//! Frames fill an image `n_times` lines at a time. Completed images are
//! summed over `accumulation_frames * averaging_frames` images; the sum is
//! divided by the averaging count only, so accumulation brightens while
//! averaging smooths.

use flim_types::{AveragedImage, CrsTable, ImagingConfig, ScanGeometry, CHANNEL_COUNT};
use tracing::trace;

use crate::error::StageError;

/// What adding a frame did to the running cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulated {
    /// The current image still has empty lines.
    Pending,
    /// An image was completed; the cycle needs more. Counts are 1-based.
    ImageDone { accumulation: usize, averaging: usize },
    /// The last image of the cycle was completed.
    CycleDone {
        accumulation: usize,
        averaging: usize,
        image: AveragedImage,
    },
}

pub struct ImageAccumulator {
    geometry: ScanGeometry,
    imaging: ImagingConfig,
    sums: [Vec<f32>; CHANNEL_COUNT],
    /// Pixels per channel filled in the current image.
    written: usize,
    /// Images completed in the current cycle.
    acquired: usize,
    sequence: u64,
}

impl ImageAccumulator {
    pub fn new(geometry: ScanGeometry, imaging: ImagingConfig) -> Self {
        let image_len = geometry.image_len();
        Self {
            geometry,
            imaging,
            sums: std::array::from_fn(|_| vec![0.0; image_len]),
            written: 0,
            acquired: 0,
            sequence: 0,
        }
    }

    /// Drops any partial image or cycle.
    pub fn reset(&mut self) {
        for channel in &mut self.sums {
            channel.fill(0.0);
        }
        self.written = 0;
        self.acquired = 0;
    }

    /// True when the next frame starts both a new image and a new cycle.
    pub fn at_cycle_start(&self) -> bool {
        self.written == 0 && self.acquired == 0
    }

    pub fn imaging(&self) -> &ImagingConfig {
        &self.imaging
    }

    /// Adds one frame of line-major `[pulse_lines][CHANNEL_COUNT]`
    /// intensities at the current write position.
    pub fn push_frame(&mut self, intensity: &[f32]) -> Result<Accumulated, StageError> {
        let lines = self.geometry.pulse_lines();
        if intensity.len() != lines * CHANNEL_COUNT {
            return Err(StageError::BadInput(format!(
                "expected {} intensities per frame, got {}",
                lines * CHANNEL_COUNT,
                intensity.len()
            )));
        }

        let offset = self.written;
        for (c, sum) in self.sums.iter_mut().enumerate() {
            let dst = &mut sum[offset..offset + lines];
            for (line, d) in dst.iter_mut().enumerate() {
                *d += intensity[line * CHANNEL_COUNT + c];
            }
        }
        self.written += lines;
        if self.written < self.geometry.image_len() {
            return Ok(Accumulated::Pending);
        }

        self.written = 0;
        self.acquired += 1;
        let accumulation = (self.acquired - 1) % self.imaging.accumulation_frames + 1;
        let averaging = (self.acquired - 1) / self.imaging.accumulation_frames + 1;
        trace!(
            "Image complete (accumulation {}, averaging {})",
            accumulation,
            averaging
        );

        if self.acquired < self.imaging.images_per_cycle() {
            return Ok(Accumulated::ImageDone {
                accumulation,
                averaging,
            });
        }

        let image = self.finish_cycle();
        Ok(Accumulated::CycleDone {
            accumulation,
            averaging,
            image,
        })
    }

    fn finish_cycle(&mut self) -> AveragedImage {
        let n_pixels = self.geometry.n_pixels;
        let n_lines = self.geometry.n_lines;
        let divisor = self.imaging.averaging_frames as f32;
        let shift = self.imaging.galvo_shift % n_lines;
        let crs = self.imaging.crs.as_ref();

        let channels = std::array::from_fn(|c| {
            let sum = &mut self.sums[c];
            let mut out: Vec<f32> = sum.iter().map(|v| v / divisor).collect();
            if let Some(table) = crs {
                compensate_rows(&mut out, n_pixels, table);
            }
            out.rotate_left(shift * n_pixels);
            sum.fill(0.0);
            out
        });

        self.acquired = 0;
        self.sequence += 1;
        AveragedImage {
            sequence: self.sequence,
            n_pixels,
            n_lines,
            accumulation: self.imaging.accumulation_frames,
            averaging: self.imaging.averaging_frames,
            channels,
        }
    }
}

/// Resamples every row through a CRS table.
fn compensate_rows(image: &mut [f32], n_pixels: usize, table: &CrsTable) {
    let mut row_in = vec![0.0; n_pixels];
    for row in image.chunks_mut(n_pixels) {
        row_in.copy_from_slice(row);
        for (k, out) in row.iter_mut().enumerate() {
            let i = table.index[k];
            let w = table.weight[k];
            *out = w * row_in[i] + (1.0 - w) * row_in[i + 1];
        }
    }
}

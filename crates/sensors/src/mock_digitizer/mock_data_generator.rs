use std::f32::consts::PI;

use flim_types::{PulseWindows, ScanGeometry, CHANNEL_COUNT};
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::types::DriverError;

/// Shape of the synthetic fluorescence pulses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseShape {
    /// Channel regions; each channel's decay starts at its window start.
    pub windows: PulseWindows,
    /// Peak height of each channel's decay, in counts above baseline.
    pub amplitudes: [f32; CHANNEL_COUNT],
    /// Decay constant of each channel, in samples.
    pub decay_samples: [f32; CHANNEL_COUNT],
    /// Detector offset in counts.
    pub baseline: f32,
    /// Standard deviation of the additive noise, in counts.
    pub noise: f32,
    /// Emit negative-going pulses, as a PMT on the digitizer input does.
    pub negative_polarity: bool,
}

impl Default for PulseShape {
    fn default() -> Self {
        Self {
            windows: PulseWindows::default(),
            amplitudes: [12000.0, 9000.0, 6000.0, 3000.0],
            decay_samples: [2.0, 6.0, 4.0, 3.0],
            baseline: 200.0,
            noise: 20.0,
            negative_polarity: true,
        }
    }
}

/// Fills raw frames with decaying pulses whose amplitudes vary smoothly over
/// the image, so that a rendered channel shows a recognisable pattern.
pub struct PulseGenerator {
    geometry: ScanGeometry,
    shape: PulseShape,
    template: Vec<f32>,
    noise: Option<Normal<f32>>,
    rng: StdRng,
}

impl PulseGenerator {
    pub fn new(geometry: ScanGeometry, shape: PulseShape, seed: u64) -> Result<Self, DriverError> {
        geometry.validate()?;
        shape.windows.validate_for_width(geometry.n_scans)?;
        let noise = if shape.noise > 0.0 {
            Some(Normal::new(0.0, shape.noise).map_err(|e| {
                DriverError::ConfigurationError(format!("Invalid noise level: {}", e))
            })?)
        } else {
            None
        };
        debug!(
            "Creating pulse generator for {} pixels x {} lines per frame",
            geometry.n_pixels, geometry.n_times
        );
        let template = Self::build_template(&geometry, &shape);
        Ok(Self {
            geometry,
            shape,
            template,
            noise,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// One noiseless pulse at unit modulation.
    fn build_template(geometry: &ScanGeometry, shape: &PulseShape) -> Vec<f32> {
        let mut template = vec![0.0; geometry.n_scans];
        for channel in 0..CHANNEL_COUNT {
            let region = shape.windows.region(channel);
            let tau = shape.decay_samples[channel].max(f32::EPSILON);
            for (offset, sample) in template[region].iter_mut().enumerate() {
                *sample += shape.amplitudes[channel] * (-(offset as f32) / tau).exp();
            }
        }
        template
    }

    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }

    /// Writes one frame of `geometry.frame_len()` samples.
    pub fn fill_frame(&mut self, frame_index: u64, samples: &mut [u16]) {
        let geometry = &self.geometry;
        let baseline = self.to_counts(0.0);
        samples.fill(baseline);

        let frames_per_image = geometry.frames_per_image() as u64;
        let row_base = (frame_index % frames_per_image) as usize * geometry.n_times;
        trace!("Generating frame {} (image rows from {})", frame_index, row_base);

        for t in 0..geometry.n_times {
            let row = row_base + t;
            let row_phase = row as f32 / geometry.n_lines as f32;
            let row_start = t * geometry.n_segments;
            for pixel in 0..geometry.n_pixels {
                let col_phase = pixel as f32 / geometry.n_pixels as f32;
                let modulation =
                    0.6 + 0.4 * (2.0 * PI * col_phase).sin() * (2.0 * PI * row_phase).cos();
                let start = row_start + geometry.pulse_offset(pixel);
                for (s, &level) in self.template.iter().enumerate() {
                    let noise = match &self.noise {
                        Some(dist) => dist.sample(&mut self.rng),
                        None => 0.0,
                    };
                    samples[start + s] = self.to_counts(level * modulation + noise);
                }
            }
        }
    }

    /// Converts a signal level above baseline into raw digitizer counts.
    fn to_counts(&self, level: f32) -> u16 {
        let value = (self.shape.baseline + level).clamp(0.0, 65532.0);
        if self.shape.negative_polarity {
            (65532.0 - value).round() as u16
        } else {
            value.round() as u16
        }
    }
}

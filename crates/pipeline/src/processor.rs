//! Pulse-to-intensity transform.
//!
//! Each line of a pulse block is converted to `f32`, background-subtracted
//! and integrated over the four channel windows; the sums are normalized by
//! [`SAMPLE_FULL_SCALE`]. Scratch memory is sized on the first call after a
//! configuration or shape change and reused afterwards.

use flim_types::{ConfigError, ProcessingConfig, CHANNEL_COUNT, SAMPLE_FULL_SCALE, SATURATION_LEVEL, WINDOW_EDGES};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// Buffers and derived constants for one pulse width / line count.
#[derive(Debug)]
struct Scratch {
    width: usize,
    lines: usize,
    /// Ratio between the up-sampled and the acquired sample grid.
    factor: f32,
    /// Window starts on the up-sampled grid.
    scaled_starts: [usize; WINDOW_EDGES],
    /// Shortest channel window on the up-sampled grid.
    roi_len: usize,
    /// Shortest channel window on the acquired grid.
    raw_roi_len: usize,
    /// Background-subtracted pulses, `[lines][width]`.
    pulse: Vec<f32>,
    /// Interpolated pulses, `[lines][width * upsample_factor]`; empty when
    /// up-sampling is off.
    upsampled: Vec<f32>,
    /// `[lines][CHANNEL_COUNT]`.
    intensity: Vec<f32>,
    saturated: Vec<bool>,
}

impl Scratch {
    fn new(config: &ProcessingConfig, width: usize, lines: usize) -> Self {
        let up = config.upsample_factor;
        let factor = if up > 1 {
            (width * up - 1) as f32 / (width - 1) as f32
        } else {
            1.0
        };
        let up_width = width * up;
        let scaled_starts: [usize; WINDOW_EDGES] = std::array::from_fn(|i| {
            ((config.windows.starts[i] as f32 * factor).round() as usize).min(up_width)
        });
        let roi_len = (0..CHANNEL_COUNT)
            .map(|c| scaled_starts[c + 1] - scaled_starts[c])
            .min()
            .unwrap_or(0);
        let raw_roi_len = config
            .windows
            .region_lengths()
            .into_iter()
            .min()
            .unwrap_or(0);

        Self {
            width,
            lines,
            factor,
            scaled_starts,
            roi_len,
            raw_roi_len,
            pulse: vec![0.0; width * lines],
            upsampled: if up > 1 {
                vec![0.0; up_width * lines]
            } else {
                Vec::new()
            },
            intensity: vec![0.0; lines * CHANNEL_COUNT],
            saturated: vec![false; lines * CHANNEL_COUNT],
        }
    }
}

#[derive(Debug)]
enum ProcessorState {
    Uninitialized,
    Ready(Scratch),
}

/// Converts blocks of raw pulses into per-channel intensities.
#[derive(Debug)]
pub struct PulseProcessor {
    config: ProcessingConfig,
    state: ProcessorState,
}

impl PulseProcessor {
    pub fn new(config: ProcessingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: ProcessorState::Uninitialized,
        })
    }

    /// Replaces the configuration; scratch is rebuilt on the next call.
    pub fn set_config(&mut self, config: ProcessingConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        self.state = ProcessorState::Uninitialized;
        Ok(())
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, ProcessorState::Ready(_))
    }

    /// Processes `raw`, a block of pulses each `width` samples long, and
    /// returns line-major `[lines][CHANNEL_COUNT]` intensities.
    pub fn process(&mut self, raw: &[u16], width: usize) -> PipelineResult<&[f32]> {
        if width == 0 || raw.is_empty() || raw.len() % width != 0 {
            return Err(PipelineError::InvalidInput {
                message: format!(
                    "pulse block of {} samples is not a whole number of {}-sample pulses",
                    raw.len(),
                    width
                ),
            });
        }
        let lines = raw.len() / width;

        let needs_init = match &self.state {
            ProcessorState::Uninitialized => true,
            ProcessorState::Ready(s) => s.width != width || s.lines != lines,
        };
        if needs_init {
            self.config.validate_for_width(width)?;
            debug!(
                "Initializing pulse processor: {} lines of {} samples, up-sampling x{}",
                lines, width, self.config.upsample_factor
            );
            self.state = ProcessorState::Ready(Scratch::new(&self.config, width, lines));
        }
        let ProcessorState::Ready(scratch) = &mut self.state else {
            unreachable!("processor initialized above");
        };

        let config = &self.config;
        let background = config.background;
        let starts = config.windows.starts;
        let detect = config.detect_saturation;
        let raw_roi_len = scratch.raw_roi_len;
        let scaled_starts = scratch.scaled_starts;
        let factor = scratch.factor;

        let lines_iter = scratch
            .pulse
            .par_chunks_mut(width)
            .zip(raw.par_chunks(width))
            .zip(scratch.intensity.par_chunks_mut(CHANNEL_COUNT))
            .zip(scratch.saturated.par_chunks_mut(CHANNEL_COUNT));

        if scratch.upsampled.is_empty() {
            lines_iter.for_each(|(((pulse, src), out), sat)| {
                convert_line(src, pulse, background);
                mark_saturation(src, &starts, raw_roi_len, detect, sat);
                for c in 0..CHANNEL_COUNT {
                    out[c] = if sat[c] {
                        0.0
                    } else {
                        pulse[starts[c]..starts[c + 1]].iter().sum::<f32>() / SAMPLE_FULL_SCALE
                    };
                }
            });
        } else {
            let up_width = scratch.upsampled.len() / lines;
            lines_iter
                .zip(scratch.upsampled.par_chunks_mut(up_width))
                .for_each(|((((pulse, src), out), sat), fine)| {
                    convert_line(src, pulse, background);
                    mark_saturation(src, &starts, raw_roi_len, detect, sat);
                    interpolate_line(pulse, fine, factor);
                    for c in 0..CHANNEL_COUNT {
                        out[c] = if sat[c] {
                            0.0
                        } else {
                            let sum: f32 = fine[scaled_starts[c]..scaled_starts[c + 1]].iter().sum();
                            sum / factor / SAMPLE_FULL_SCALE
                        };
                    }
                });
        }

        Ok(scratch.intensity.as_slice())
    }

    fn scratch(&self) -> Option<&Scratch> {
        match &self.state {
            ProcessorState::Ready(s) => Some(s),
            ProcessorState::Uninitialized => None,
        }
    }

    /// Intensities of the last processed block.
    pub fn intensity(&self) -> Option<&[f32]> {
        self.scratch().map(|s| s.intensity.as_slice())
    }

    /// Background-subtracted pulses of the last processed block.
    pub fn pulse(&self) -> Option<&[f32]> {
        self.scratch().map(|s| s.pulse.as_slice())
    }

    /// Background-subtracted pulse of one line of the last block.
    pub fn line_pulse(&self, line: usize) -> Option<&[f32]> {
        let s = self.scratch()?;
        s.pulse.get(line * s.width..(line + 1) * s.width)
    }

    pub fn scale_factor(&self) -> Option<f32> {
        self.scratch().map(|s| s.factor)
    }

    pub fn scaled_starts(&self) -> Option<[usize; WINDOW_EDGES]> {
        self.scratch().map(|s| s.scaled_starts)
    }

    pub fn pulse_roi_len(&self) -> Option<usize> {
        self.scratch().map(|s| s.roi_len)
    }

    /// Address of the intensity scratch buffer; stays the same as long as no
    /// re-initialization happens.
    pub fn scratch_id(&self) -> Option<usize> {
        self.scratch().map(|s| s.intensity.as_ptr() as usize)
    }
}

fn convert_line(src: &[u16], dst: &mut [f32], background: f32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s as f32 - background;
    }
}

/// A channel saturates when any raw sample at the head of its window clips.
fn mark_saturation(
    src: &[u16],
    starts: &[usize; WINDOW_EDGES],
    roi_len: usize,
    enabled: bool,
    saturated: &mut [bool],
) {
    for (c, flag) in saturated.iter_mut().enumerate() {
        *flag = enabled
            && src[starts[c]..starts[c] + roi_len]
                .iter()
                .any(|&s| s > SATURATION_LEVEL);
    }
}

/// Linear interpolation of `coarse` onto the `fine` grid so that both end
/// points coincide.
fn interpolate_line(coarse: &[f32], fine: &mut [f32], factor: f32) {
    let last = coarse.len() - 1;
    for (p, out) in fine.iter_mut().enumerate() {
        let x = p as f32 / factor;
        let i0 = (x.floor() as usize).min(last);
        let i1 = (i0 + 1).min(last);
        let frac = x - i0 as f32;
        *out = coarse[i0] + (coarse[i1] - coarse[i0]) * frac;
    }
}

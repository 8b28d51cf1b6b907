//! Configuration types for a FLIm acquisition session.
//!
//! Everything here is an immutable snapshot: the pipeline is built from one
//! [`SessionConfig`] and the only thing that may change while it runs is the
//! [`ProcessingConfig`], which is swapped wholesale between frames.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of emission channels integrated out of every pulse.
pub const CHANNEL_COUNT: usize = 4;

/// Number of window edges delimiting the channel regions.
pub const WINDOW_EDGES: usize = CHANNEL_COUNT + 1;

/// Divisor applied to integrated intensities.
pub const SAMPLE_FULL_SCALE: f32 = 65532.0;

/// Raw samples strictly above this level count as saturated.
pub const SATURATION_LEVEL: u16 = 65531;

/// Largest sync compensation shift accepted, in pixels.
pub const MAX_COMP_PIXELS: i32 = 40;

/// Smallest event channel accepted; leaves room for lifecycle events.
pub const MIN_EVENT_CAPACITY: usize = 16;

/// Errors raised while validating configuration snapshots.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("channel window start {index} ({value}) must be greater than start {prev_index} ({prev_value})")]
    NonIncreasingWindows {
        index: usize,
        value: usize,
        prev_index: usize,
        prev_value: usize,
    },

    #[error("channel windows end at sample {end} but pulses are only {width} samples wide")]
    WindowPastPulseEnd { end: usize, width: usize },

    #[error("background level must be finite, got {0}")]
    NonFiniteBackground(f32),

    #[error("up-sampling factor must be at least 1")]
    ZeroUpsampleFactor,

    #[error("sample interval must be positive, got {0} ns")]
    InvalidSampleInterval(f32),

    #[error("buffer pool must hold at least one buffer")]
    EmptyPool,

    #[error("buffers must hold at least one element")]
    EmptyBuffer,

    #[error("scan geometry field '{0}' must be non-zero")]
    ZeroGeometry(&'static str),

    #[error("{n_lines} image lines cannot be split into frames of {n_times} lines")]
    UnevenFrames { n_lines: usize, n_times: usize },

    #[error("sync compensation of {0} pixels is outside -{max}..={max}", max = MAX_COMP_PIXELS)]
    CompensationOutOfRange(i32),

    #[error("{required} segments needed to reorder a frame but only {available} are acquired")]
    NotEnoughSegments { required: usize, available: usize },

    #[error("{field} must be at least 1")]
    ZeroFrameCount { field: &'static str },

    #[error("{field} ({value}) must be smaller than the {n_lines} image lines")]
    ShiftTooLarge {
        field: &'static str,
        value: usize,
        n_lines: usize,
    },

    #[error("CRS table has {len} entries but images are {width} pixels wide")]
    CrsLengthMismatch { len: usize, width: usize },

    #[error("CRS entry {entry} references pixel {index} outside 0..{limit}")]
    CrsIndexOutOfRange {
        entry: usize,
        index: usize,
        limit: usize,
    },

    #[error("CRS line {line} is malformed: {reason}")]
    CrsParse { line: usize, reason: String },

    #[error("contrast range for channel {channel} is empty ({min} >= {max})")]
    EmptyContrast { channel: usize, min: f32, max: f32 },

    #[error("channel mode {0} is assigned to more than one channel")]
    DuplicateChannelMode(&'static str),

    #[error("event channel capacity {capacity} is below the minimum of {min}")]
    EventCapacityTooSmall { capacity: usize, min: usize },

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err.to_string())
    }
}

/// Five strictly increasing sample indices cutting a pulse into four
/// channel regions `[starts[c], starts[c + 1])`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseWindows {
    pub starts: [usize; WINDOW_EDGES],
}

impl PulseWindows {
    /// Builds a window set, rejecting non-increasing starts.
    pub fn new(starts: [usize; WINDOW_EDGES]) -> Result<Self, ConfigError> {
        let windows = Self { starts };
        windows.validate()?;
        Ok(windows)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for index in 1..WINDOW_EDGES {
            let (prev_value, value) = (self.starts[index - 1], self.starts[index]);
            if value <= prev_value {
                return Err(ConfigError::NonIncreasingWindows {
                    index,
                    value,
                    prev_index: index - 1,
                    prev_value,
                });
            }
        }
        Ok(())
    }

    /// Validates the windows against a concrete pulse width.
    pub fn validate_for_width(&self, width: usize) -> Result<(), ConfigError> {
        self.validate()?;
        let end = self.end();
        if end > width {
            return Err(ConfigError::WindowPastPulseEnd { end, width });
        }
        Ok(())
    }

    /// Sample range integrated for `channel`.
    pub fn region(&self, channel: usize) -> Range<usize> {
        self.starts[channel]..self.starts[channel + 1]
    }

    pub fn region_lengths(&self) -> [usize; CHANNEL_COUNT] {
        std::array::from_fn(|c| self.starts[c + 1] - self.starts[c])
    }

    pub fn end(&self) -> usize {
        self.starts[CHANNEL_COUNT]
    }
}

impl Default for PulseWindows {
    fn default() -> Self {
        Self {
            starts: [0, 25, 50, 75, 100],
        }
    }
}

/// Parameters of the pulse-to-intensity transform. May be replaced between
/// frames while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Scalar baseline subtracted from every converted sample.
    #[serde(default)]
    pub background: f32,
    #[serde(default)]
    pub windows: PulseWindows,
    /// Digitizer sample interval in nanoseconds.
    #[serde(default = "default_sample_interval_ns")]
    pub sample_interval_ns: f32,
    /// Linear up-sampling factor applied before integration; 1 disables it.
    #[serde(default = "default_upsample_factor")]
    pub upsample_factor: usize,
    /// Zero out channels whose raw samples clip.
    #[serde(default)]
    pub detect_saturation: bool,
}

/// 400 MHz digitizer.
fn default_sample_interval_ns() -> f32 {
    1000.0 / 400.0
}

fn default_upsample_factor() -> usize {
    1
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            background: 0.0,
            windows: PulseWindows::default(),
            sample_interval_ns: default_sample_interval_ns(),
            upsample_factor: default_upsample_factor(),
            detect_saturation: false,
        }
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.background.is_finite() {
            return Err(ConfigError::NonFiniteBackground(self.background));
        }
        if self.upsample_factor == 0 {
            return Err(ConfigError::ZeroUpsampleFactor);
        }
        if !(self.sample_interval_ns.is_finite() && self.sample_interval_ns > 0.0) {
            return Err(ConfigError::InvalidSampleInterval(self.sample_interval_ns));
        }
        self.windows.validate()
    }

    /// Validates the transform against a concrete pulse width.
    pub fn validate_for_width(&self, width: usize) -> Result<(), ConfigError> {
        self.validate()?;
        self.windows.validate_for_width(width)
    }
}

/// Shape of one acquired frame and of the image it feeds.
///
/// A frame holds `n_times` rows of `n_segments` samples. Each row is cut into
/// `n_pixels` pulses of `n_scans` samples, so a frame yields `n_times` image
/// lines of `n_pixels` pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanGeometry {
    /// Samples per pulse.
    pub n_scans: usize,
    /// Pixels along the fast axis.
    pub n_pixels: usize,
    /// Image lines acquired per frame.
    pub n_times: usize,
    /// Samples per acquired row.
    pub n_segments: usize,
    /// Image lines along the slow axis.
    pub n_lines: usize,
    /// Resonant-scanner sync compensation: one extra sample of shift every
    /// `comp_pixels` pixels, negative to shift backwards, 0 disables it.
    #[serde(default)]
    pub comp_pixels: i32,
}

impl Default for ScanGeometry {
    fn default() -> Self {
        Self {
            n_scans: 100,
            n_pixels: 500,
            n_times: 4,
            n_segments: 65536,
            n_lines: 512,
            comp_pixels: 0,
        }
    }
}

impl ScanGeometry {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("n_scans", self.n_scans),
            ("n_pixels", self.n_pixels),
            ("n_times", self.n_times),
            ("n_segments", self.n_segments),
            ("n_lines", self.n_lines),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroGeometry(name));
            }
        }
        if self.n_lines % self.n_times != 0 {
            return Err(ConfigError::UnevenFrames {
                n_lines: self.n_lines,
                n_times: self.n_times,
            });
        }
        if self.comp_pixels.abs() > MAX_COMP_PIXELS {
            return Err(ConfigError::CompensationOutOfRange(self.comp_pixels));
        }
        let required = self.pulse_offset(self.n_pixels - 1) + self.n_scans;
        if required > self.n_segments {
            return Err(ConfigError::NotEnoughSegments {
                required,
                available: self.n_segments,
            });
        }
        Ok(())
    }

    /// Raw samples per acquired frame.
    pub fn frame_len(&self) -> usize {
        self.n_segments * self.n_times
    }

    /// Pulses (processing lines) per frame.
    pub fn pulse_lines(&self) -> usize {
        self.n_pixels * self.n_times
    }

    /// Samples in the reordered pulse block of one frame.
    pub fn pulse_block_len(&self) -> usize {
        self.pulse_lines() * self.n_scans
    }

    /// Pixels per channel image.
    pub fn image_len(&self) -> usize {
        self.n_pixels * self.n_lines
    }

    pub fn frames_per_image(&self) -> usize {
        self.n_lines / self.n_times
    }

    /// Sample offset, within one acquired row, of the pulse for `pixel`
    /// after sync compensation.
    pub fn pulse_offset(&self, pixel: usize) -> usize {
        let base = pixel * self.n_scans;
        if self.comp_pixels == 0 {
            return base;
        }
        let shift = pixel as i64 / self.comp_pixels as i64;
        (base as i64 + shift).max(0) as usize
    }
}

/// Per-row resampling table correcting the resonant scanner's sinusoidal
/// sweep: `out[k] = w[k] * row[idx[k]] + (1 - w[k]) * row[idx[k] + 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrsTable {
    pub index: Vec<usize>,
    pub weight: Vec<f32>,
}

impl CrsTable {
    /// A table that leaves rows untouched.
    pub fn identity(width: usize) -> Self {
        let mut index: Vec<usize> = (0..width).collect();
        let mut weight = vec![1.0; width];
        if width >= 2 {
            index[width - 1] = width - 2;
            weight[width - 1] = 0.0;
        }
        Self { index, weight }
    }

    /// Parses a tab-separated table with one `index<TAB>weight` pair per line.
    /// Blank lines are skipped.
    pub fn from_tab_separated(text: &str) -> Result<Self, ConfigError> {
        let mut index = Vec::new();
        let mut weight = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t').map(str::trim);
            let (Some(idx), Some(w)) = (fields.next(), fields.next()) else {
                return Err(ConfigError::CrsParse {
                    line: line_no + 1,
                    reason: "expected two tab-separated fields".to_string(),
                });
            };
            let idx: usize = idx.parse().map_err(|e| ConfigError::CrsParse {
                line: line_no + 1,
                reason: format!("bad index '{}': {}", idx, e),
            })?;
            let w: f32 = w.parse().map_err(|e| ConfigError::CrsParse {
                line: line_no + 1,
                reason: format!("bad weight '{}': {}", w, e),
            })?;
            index.push(idx);
            weight.push(w);
        }
        Ok(Self { index, weight })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn validate(&self, width: usize) -> Result<(), ConfigError> {
        if self.index.len() != width || self.weight.len() != width {
            return Err(ConfigError::CrsLengthMismatch {
                len: self.index.len().min(self.weight.len()),
                width,
            });
        }
        let limit = width.saturating_sub(1);
        for (entry, &index) in self.index.iter().enumerate() {
            if index >= limit {
                return Err(ConfigError::CrsIndexOutOfRange {
                    entry,
                    index,
                    limit,
                });
            }
        }
        Ok(())
    }
}

/// How finished images are built from the per-frame intensities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingConfig {
    /// Images summed without normalization.
    #[serde(default = "default_frame_count")]
    pub accumulation_frames: usize,
    /// Images summed and then divided out.
    #[serde(default = "default_frame_count")]
    pub averaging_frames: usize,
    /// Circular row rotation compensating the galvo phase lag.
    #[serde(default = "default_galvo_shift")]
    pub galvo_shift: usize,
    /// Rows lost to galvo fly-back, cropped from saved bitmaps.
    #[serde(default = "default_flying_back")]
    pub flying_back: usize,
    #[serde(default)]
    pub crs: Option<CrsTable>,
}

fn default_frame_count() -> usize {
    1
}

fn default_galvo_shift() -> usize {
    2
}

fn default_flying_back() -> usize {
    12
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            accumulation_frames: default_frame_count(),
            averaging_frames: default_frame_count(),
            galvo_shift: default_galvo_shift(),
            flying_back: default_flying_back(),
            crs: None,
        }
    }
}

impl ImagingConfig {
    /// Images that go into one finished image.
    pub fn images_per_cycle(&self) -> usize {
        self.accumulation_frames * self.averaging_frames
    }

    pub fn validate(&self, geometry: &ScanGeometry) -> Result<(), ConfigError> {
        if self.accumulation_frames == 0 {
            return Err(ConfigError::ZeroFrameCount {
                field: "accumulation_frames",
            });
        }
        if self.averaging_frames == 0 {
            return Err(ConfigError::ZeroFrameCount {
                field: "averaging_frames",
            });
        }
        for (field, value) in [
            ("galvo_shift", self.galvo_shift),
            ("flying_back", self.flying_back),
        ] {
            if value >= geometry.n_lines {
                return Err(ConfigError::ShiftTooLarge {
                    field,
                    value,
                    n_lines: geometry.n_lines,
                });
            }
        }
        if let Some(crs) = &self.crs {
            crs.validate(geometry.n_pixels)?;
        }
        Ok(())
    }
}

/// The four detection channels, in channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMode {
    Shg,
    Tpfe,
    Cars,
    Rcm,
}

impl ChannelMode {
    pub const ALL: [ChannelMode; CHANNEL_COUNT] = [
        ChannelMode::Shg,
        ChannelMode::Tpfe,
        ChannelMode::Cars,
        ChannelMode::Rcm,
    ];

    pub fn from_channel(channel: usize) -> Option<Self> {
        Self::ALL.get(channel).copied()
    }

    /// Label used in file and directory names.
    pub fn label(&self) -> &'static str {
        match self {
            ChannelMode::Shg => "SHG",
            ChannelMode::Tpfe => "TPFE",
            ChannelMode::Cars => "CARS",
            ChannelMode::Rcm => "RCM",
        }
    }
}

/// Intensity window mapped onto 0..=255 when bitmaps are written.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContrastRange {
    pub min: f32,
    pub max: f32,
}

impl Default for ContrastRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl ContrastRange {
    /// Maps an intensity onto an 8-bit grey level, clamping at both ends.
    pub fn scale(&self, value: f32) -> u8 {
        let t = (value - self.min) / (self.max - self.min);
        (t * 255.0).round().clamp(0.0, 255.0) as u8
    }
}

/// Capacities and options of the recording buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Finished images that fit in memory.
    #[serde(default = "default_image_capacity")]
    pub image_capacity: usize,
    /// Raw frames that fit in memory.
    #[serde(default = "default_pulse_capacity")]
    pub pulse_capacity: usize,
    /// Also keep the raw frames of a recording.
    #[serde(default)]
    pub record_pulses: bool,
    /// Buffers queued between a capture call and its copy thread.
    #[serde(default = "default_staging_depth")]
    pub staging_depth: usize,
    /// Tiles per row of a serpentine stitching scan; 1 for a single column.
    #[serde(default = "default_stitch_x_step")]
    pub stitch_x_step: usize,
    #[serde(default)]
    pub contrast: [ContrastRange; CHANNEL_COUNT],
    /// Detection mode wired to each digitizer channel; names the bitmaps.
    #[serde(default = "default_channel_modes")]
    pub channel_modes: [ChannelMode; CHANNEL_COUNT],
}

fn default_image_capacity() -> usize {
    1000
}

fn default_pulse_capacity() -> usize {
    5000
}

fn default_staging_depth() -> usize {
    8
}

fn default_stitch_x_step() -> usize {
    1
}

fn default_channel_modes() -> [ChannelMode; CHANNEL_COUNT] {
    ChannelMode::ALL
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            image_capacity: default_image_capacity(),
            pulse_capacity: default_pulse_capacity(),
            record_pulses: false,
            staging_depth: default_staging_depth(),
            stitch_x_step: default_stitch_x_step(),
            contrast: [ContrastRange::default(); CHANNEL_COUNT],
            channel_modes: default_channel_modes(),
        }
    }
}

impl RecordingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_capacity == 0 || self.staging_depth == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.record_pulses && self.pulse_capacity == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.stitch_x_step == 0 {
            return Err(ConfigError::ZeroFrameCount {
                field: "stitch_x_step",
            });
        }
        for (channel, range) in self.contrast.iter().enumerate() {
            if !(range.min < range.max) {
                return Err(ConfigError::EmptyContrast {
                    channel,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        for (channel, mode) in self.channel_modes.iter().enumerate() {
            if self.channel_modes[..channel].contains(mode) {
                return Err(ConfigError::DuplicateChannelMode(mode.label()));
            }
        }
        Ok(())
    }
}

/// Everything fixed for the lifetime of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub geometry: ScanGeometry,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub imaging: ImagingConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Buffers in each inter-stage pool.
    #[serde(default = "default_pool_depth")]
    pub pool_depth: usize,
    /// Flip raw samples to `65532 - s` on arrival (negative-going detectors).
    #[serde(default = "default_invert_samples")]
    pub invert_samples: bool,
    /// Pin stage threads to dedicated cores when available.
    #[serde(default)]
    pub pin_threads: bool,
    /// Events buffered for the host before per-frame updates are dropped.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_pool_depth() -> usize {
    50
}

fn default_invert_samples() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            geometry: ScanGeometry::default(),
            processing: ProcessingConfig::default(),
            imaging: ImagingConfig::default(),
            recording: RecordingConfig::default(),
            pool_depth: default_pool_depth(),
            invert_samples: default_invert_samples(),
            pin_threads: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl SessionConfig {
    /// Checks every section and their cross-constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_depth == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.event_capacity < MIN_EVENT_CAPACITY {
            return Err(ConfigError::EventCapacityTooSmall {
                capacity: self.event_capacity,
                min: MIN_EVENT_CAPACITY,
            });
        }
        self.geometry.validate()?;
        self.processing.validate_for_width(self.geometry.n_scans)?;
        self.imaging.validate(&self.geometry)?;
        self.recording.validate()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

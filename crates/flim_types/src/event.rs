//! Events published by the pipeline.
//!
//! Every consumer-facing notification (display updates, progress, status
//! text, recording and save outcomes) travels as one [`PipelineEvent`] on a
//! single channel. Large payloads are wrapped in `Arc` so that fanning an
//! event out to several readers never copies image data.

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::data::{AveragedImage, IntensityFrame};

/// A human-readable status line, flagged when it reports a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub timestamp: DateTime<Local>,
    pub text: String,
    pub is_error: bool,
}

impl StatusMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            text: text.into(),
            is_error: true,
        }
    }
}

/// Counts reported when a recording session stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub images: usize,
    pub pulses: usize,
    /// Bytes held by the recorded images and pulses.
    pub bytes: usize,
}

impl RecordingSummary {
    pub fn megabytes(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Status(StatusMessage),
    /// Intensities of one processed frame.
    Intensity(Arc<IntensityFrame>),
    /// A finished accumulation/averaging cycle.
    Image(Arc<AveragedImage>),
    /// One more image entered the running cycle. Both counters are 1-based.
    Progress { accumulation: usize, averaging: usize },
    /// Background-subtracted pulse of the probed line, for window calibration.
    CalibrationPulse {
        frame_index: u64,
        line: usize,
        samples: Arc<[f32]>,
    },
    RecordingStarted,
    RecordingStopped(RecordingSummary),
    SaveProgress { written: usize, total: usize },
    SaveFinished { success: bool },
    /// Every stage has drained and exited.
    Stopped,
}

impl PipelineEvent {
    pub fn status(text: impl Into<String>) -> Self {
        PipelineEvent::Status(StatusMessage::info(text))
    }

    pub fn error(text: impl Into<String>) -> Self {
        PipelineEvent::Status(StatusMessage::error(text))
    }

    /// Get a human-readable description of the event type
    pub fn event_type_name(&self) -> &'static str {
        match self {
            PipelineEvent::Status(_) => "Status",
            PipelineEvent::Intensity(_) => "Intensity",
            PipelineEvent::Image(_) => "Image",
            PipelineEvent::Progress { .. } => "Progress",
            PipelineEvent::CalibrationPulse { .. } => "CalibrationPulse",
            PipelineEvent::RecordingStarted => "RecordingStarted",
            PipelineEvent::RecordingStopped(_) => "RecordingStopped",
            PipelineEvent::SaveProgress { .. } => "SaveProgress",
            PipelineEvent::SaveFinished { .. } => "SaveFinished",
            PipelineEvent::Stopped => "Stopped",
        }
    }
}

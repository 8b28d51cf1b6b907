//! Processing stage: raw frame in, per-channel intensities out.

use std::sync::Arc;

use flim_types::{PipelineEvent, ProcessingConfig, ScanGeometry};
use flume::{Receiver, Sender};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::allocator::SharedBufferPool;
use crate::data::{ProcessedPacket, RawPacket};
use crate::error::StageError;
use crate::events::{publish, publish_display};
use crate::processor::PulseProcessor;
use crate::recording::RecordingBuffer;
use crate::stage::{Outlet, StageHandler};
use crate::stats::PipelineStats;

/// Messages the executor sends to a running processing stage.
#[derive(Debug, Clone)]
pub enum ProcessControl {
    /// Use this snapshot from the next frame on.
    Configure(ProcessingConfig),
    /// Publish the processed pulse of this line with every frame, or stop.
    Probe(Option<usize>),
}

pub struct PulseStage {
    geometry: ScanGeometry,
    processor: PulseProcessor,
    /// Reordered pulses of the current frame, `[pulse_lines][n_scans]`.
    block: Vec<u16>,
    intensity_pool: SharedBufferPool<f32>,
    raw_pool: Option<SharedBufferPool<u16>>,
    recorder: Arc<RecordingBuffer>,
    control: Receiver<ProcessControl>,
    probe: Option<usize>,
    stats: Arc<PipelineStats>,
    events: Sender<PipelineEvent>,
}

impl PulseStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        geometry: ScanGeometry,
        processor: PulseProcessor,
        intensity_pool: SharedBufferPool<f32>,
        raw_pool: Option<SharedBufferPool<u16>>,
        recorder: Arc<RecordingBuffer>,
        control: Receiver<ProcessControl>,
        stats: Arc<PipelineStats>,
        events: Sender<PipelineEvent>,
    ) -> Self {
        let block = vec![0; geometry.pulse_block_len()];
        Self {
            geometry,
            processor,
            block,
            intensity_pool,
            raw_pool,
            recorder,
            control,
            probe: None,
            stats,
            events,
        }
    }

    /// Applies pending control messages; only the newest configuration
    /// counts.
    fn apply_control(&mut self) {
        let mut newest = None;
        for message in self.control.try_iter() {
            match message {
                ProcessControl::Configure(config) => newest = Some(config),
                ProcessControl::Probe(line) => self.probe = line,
            }
        }
        if let Some(config) = newest {
            match self.processor.set_config(config) {
                Ok(()) => debug!("Processing configuration updated"),
                Err(e) => {
                    warn!("Rejected processing configuration: {}", e);
                    publish(
                        &self.events,
                        PipelineEvent::error(format!("Invalid processing configuration: {}", e)),
                    );
                }
            }
        }
    }

    /// Cuts every acquired row into per-pixel pulses, applying the sync
    /// compensation shift.
    fn reorder(&mut self, raw: &[u16]) {
        let geometry = &self.geometry;
        let n_scans = geometry.n_scans;
        let n_pixels = geometry.n_pixels;
        let n_segments = geometry.n_segments;
        self.block
            .par_chunks_mut(n_scans)
            .enumerate()
            .for_each(|(line, pulse)| {
                let (row, pixel) = (line / n_pixels, line % n_pixels);
                let start = row * n_segments + geometry.pulse_offset(pixel);
                pulse.copy_from_slice(&raw[start..start + n_scans]);
            });
    }
}

impl StageHandler for PulseStage {
    type Input = RawPacket;
    type Output = ProcessedPacket;

    fn on_data(&mut self, packet: RawPacket, outlet: &Outlet<ProcessedPacket>) -> Result<(), StageError> {
        self.apply_control();
        if packet.samples.len() != self.geometry.frame_len() {
            return Err(StageError::BadInput(format!(
                "frame {} has {} samples, expected {}",
                packet.frame_index,
                packet.samples.len(),
                self.geometry.frame_len()
            )));
        }

        self.reorder(&packet.samples);
        let intensity = self
            .processor
            .process(&self.block, self.geometry.n_scans)
            .map_err(|e| StageError::BadInput(e.to_string()))?;
        let out = self.intensity_pool.try_acquire().map(|mut buffer| {
            buffer.copy_from_slice(intensity);
            buffer
        });
        self.stats.frame_processed();

        if let Some(line) = self.probe {
            if let Some(pulse) = self.processor.line_pulse(line) {
                let event = PipelineEvent::CalibrationPulse {
                    frame_index: packet.frame_index,
                    line,
                    samples: Arc::from(pulse),
                };
                if !publish_display(&self.events, event) {
                    self.stats.display_event_dropped();
                }
            }
        }

        let Some(intensity) = out else {
            self.stats.processing_dropped();
            debug!("No free intensity buffer; frame {} dropped", packet.frame_index);
            return Ok(());
        };

        let raw = match &self.raw_pool {
            Some(pool) if self.recorder.is_recording() => match pool.try_acquire() {
                Some(mut copy) => {
                    copy.copy_from_slice(&packet.samples);
                    Some(copy)
                }
                None => {
                    self.stats.raw_copy_dropped();
                    None
                }
            },
            _ => None,
        };

        outlet.push(ProcessedPacket {
            frame_index: packet.frame_index,
            intensity,
            raw,
        })
    }

    fn on_stop(&mut self, _outlet: &Outlet<ProcessedPacket>) {
        info!(
            "Processing stage drained ({} frames processed)",
            self.stats.snapshot().frames_processed
        );
    }
}

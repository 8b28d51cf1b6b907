//! Terminal stage: builds images, publishes them and feeds the recorder.

use std::sync::Arc;

use flim_types::{AveragedImage, IntensityFrame, PipelineEvent, ScanGeometry};
use flume::Sender;
use tracing::{debug, info, warn};

use crate::accumulator::{Accumulated, ImageAccumulator};
use crate::data::ProcessedPacket;
use crate::error::StageError;
use crate::events::publish_display;
use crate::recording::{CaptureResult, RecordingBuffer};
use crate::stage::{Outlet, StageHandler};
use crate::stats::PipelineStats;

/// Raw pulse capture within one recording session. A session records the
/// raw frames of exactly one accumulation/averaging cycle, starting at a
/// cycle boundary, plus the image they produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PulseCapture {
    /// Waiting for the next cycle boundary.
    Idle,
    Capturing { remaining: usize },
    /// All frames captured; the cycle's image is still being built.
    AwaitingImage,
    Done,
}

pub struct ImageStage {
    accumulator: ImageAccumulator,
    recorder: Arc<RecordingBuffer>,
    stats: Arc<PipelineStats>,
    events: Sender<PipelineEvent>,
    lines: usize,
    frames_per_cycle: usize,
    capture: PulseCapture,
    /// Recorder generation `capture` belongs to.
    capture_generation: u64,
}

impl ImageStage {
    pub fn new(
        accumulator: ImageAccumulator,
        geometry: &ScanGeometry,
        recorder: Arc<RecordingBuffer>,
        stats: Arc<PipelineStats>,
        events: Sender<PipelineEvent>,
    ) -> Self {
        let frames_per_cycle = geometry.frames_per_image() * accumulator.imaging().images_per_cycle();
        let capture_generation = recorder.generation();
        Self {
            accumulator,
            recorder,
            stats,
            events,
            lines: geometry.pulse_lines(),
            frames_per_cycle,
            capture: PulseCapture::Idle,
            capture_generation,
        }
    }

    fn capture_pulse(&mut self, packet: &ProcessedPacket) {
        let generation = self.recorder.generation();
        if generation != self.capture_generation {
            self.capture_generation = generation;
            self.capture = PulseCapture::Idle;
        }
        if !(self.recorder.records_pulses() && self.recorder.is_recording()) {
            return;
        }

        if self.capture == PulseCapture::Idle && self.accumulator.at_cycle_start() {
            debug!("Raw pulse capture starts at frame {}", packet.frame_index);
            self.capture = PulseCapture::Capturing {
                remaining: self.frames_per_cycle,
            };
        }
        let PulseCapture::Capturing { remaining } = &mut self.capture else {
            return;
        };

        match packet.raw.as_deref() {
            Some(raw) => match self.recorder.capture_pulse(raw) {
                CaptureResult::Captured => {}
                other => warn!("Raw frame {} not recorded: {:?}", packet.frame_index, other),
            },
            None => warn!("Raw frame {} arrived without its copy", packet.frame_index),
        }
        *remaining -= 1;
        if *remaining == 0 {
            self.capture = PulseCapture::AwaitingImage;
        }
    }

    fn display(&self, event: PipelineEvent) {
        if !publish_display(&self.events, event) {
            self.stats.display_event_dropped();
        }
    }

    fn publish_image(&mut self, image: Arc<AveragedImage>) {
        self.stats.image_completed();
        let pulse_mode = self.recorder.records_pulses();

        if self.recorder.is_recording() && (!pulse_mode || self.capture == PulseCapture::AwaitingImage) {
            match self.recorder.capture_image(&image) {
                CaptureResult::Captured => {}
                CaptureResult::Full => debug!("Image buffer full; image {} not recorded", image.sequence),
                other => warn!("Image {} not recorded: {:?}", image.sequence, other),
            }
        }
        self.display(PipelineEvent::Image(image));

        if self.capture == PulseCapture::AwaitingImage {
            self.capture = PulseCapture::Done;
            match self.recorder.stop_recording() {
                Ok(summary) => info!(
                    "Raw pulse recording complete: {} frames, {} images",
                    summary.pulses, summary.images
                ),
                Err(e) => debug!("Raw pulse recording already stopped: {}", e),
            }
        }
    }
}

impl StageHandler for ImageStage {
    type Input = ProcessedPacket;
    type Output = ();

    fn on_data(&mut self, packet: ProcessedPacket, _outlet: &Outlet<()>) -> Result<(), StageError> {
        if packet.frame_index == 0 {
            self.accumulator.reset();
            if matches!(self.capture, PulseCapture::Capturing { .. }) {
                self.capture = PulseCapture::Idle;
            }
        }
        self.stats.frame_visualized();

        self.display(PipelineEvent::Intensity(Arc::new(IntensityFrame {
            frame_index: packet.frame_index,
            lines: self.lines,
            values: Arc::from(&packet.intensity[..]),
        })));

        self.capture_pulse(&packet);

        match self.accumulator.push_frame(&packet.intensity)? {
            Accumulated::Pending => {}
            Accumulated::ImageDone {
                accumulation,
                averaging,
            } => {
                self.display(PipelineEvent::Progress {
                    accumulation,
                    averaging,
                });
            }
            Accumulated::CycleDone {
                accumulation,
                averaging,
                image,
            } => {
                self.display(PipelineEvent::Progress {
                    accumulation,
                    averaging,
                });
                self.publish_image(Arc::new(image));
            }
        }
        Ok(())
    }

    fn on_stop(&mut self, _outlet: &Outlet<()>) {
        if matches!(self.capture, PulseCapture::Capturing { .. }) {
            warn!("Acquisition stopped in the middle of a raw pulse capture");
        }
        debug!("Image stage drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{BufferPool, SharedBufferPool};
    use crate::recording::UnsavedDecision;
    use flim_types::{PulseWindows, SessionConfig};

    fn session(record_pulses: bool) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.geometry = ScanGeometry {
            n_scans: 4,
            n_pixels: 2,
            n_times: 1,
            n_segments: 8,
            n_lines: 2,
            comp_pixels: 0,
        };
        config.processing.windows = PulseWindows::new([0, 1, 2, 3, 4]).unwrap();
        config.imaging.galvo_shift = 0;
        config.imaging.flying_back = 0;
        config.imaging.averaging_frames = 2;
        config.recording.image_capacity = 4;
        config.recording.pulse_capacity = 16;
        config.recording.record_pulses = record_pulses;
        config
    }

    struct Harness {
        stage: ImageStage,
        recorder: Arc<RecordingBuffer>,
        events: flume::Receiver<PipelineEvent>,
        intensity: SharedBufferPool<f32>,
        raw: SharedBufferPool<u16>,
    }

    fn harness(config: &SessionConfig) -> Harness {
        let (tx, events) = flume::unbounded();
        let recorder = RecordingBuffer::allocate(config, tx.clone()).unwrap();
        let stage = ImageStage::new(
            ImageAccumulator::new(config.geometry.clone(), config.imaging.clone()),
            &config.geometry,
            Arc::clone(&recorder),
            Arc::new(PipelineStats::default()),
            tx,
        );
        Harness {
            stage,
            recorder,
            events,
            intensity: BufferPool::allocate("intensity", 4, config.geometry.pulse_lines() * 4).unwrap(),
            raw: BufferPool::allocate("raw", 4, config.geometry.frame_len()).unwrap(),
        }
    }

    fn feed(h: &mut Harness, index: u64, value: f32) {
        let mut intensity = h.intensity.try_acquire().unwrap();
        intensity.fill(value);
        let mut raw = h.raw.try_acquire().unwrap();
        raw.fill(index as u16);
        let packet = ProcessedPacket {
            frame_index: index,
            intensity,
            raw: Some(raw),
        };
        h.stage.on_data(packet, &Outlet::none()).unwrap();
    }

    fn drain(h: &Harness) -> Vec<PipelineEvent> {
        h.events.try_iter().collect()
    }

    #[test]
    fn publishes_progress_and_images() {
        let config = session(false);
        let mut h = harness(&config);
        for i in 0..4 {
            feed(&mut h, i, 1.0);
        }
        let events = drain(&h);
        let intensities = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::Intensity(_)))
            .count();
        assert_eq!(intensities, 4);

        let progress: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Progress {
                    accumulation,
                    averaging,
                } => Some((*accumulation, *averaging)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 1), (1, 2)]);

        let images: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Image(image) => Some(Arc::clone(image)),
                _ => None,
            })
            .collect();
        assert_eq!(images.len(), 1);
        assert!(images[0].channel(0).iter().all(|&v| v == 1.0));
        assert_eq!(h.recorder.recorded_images(), 0);
    }

    #[test]
    fn frame_zero_restarts_the_cycle() {
        let config = session(false);
        let mut h = harness(&config);
        feed(&mut h, 0, 5.0);
        feed(&mut h, 1, 5.0);
        feed(&mut h, 0, 1.0);
        feed(&mut h, 1, 1.0);
        feed(&mut h, 2, 1.0);
        feed(&mut h, 3, 1.0);
        let image = drain(&h)
            .into_iter()
            .find_map(|e| match e {
                PipelineEvent::Image(image) => Some(image),
                _ => None,
            })
            .expect("one image");
        assert!(image.channel(2).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn image_recording_captures_every_finished_image() {
        let config = session(false);
        let mut h = harness(&config);
        h.recorder.start_recording(UnsavedDecision::Ignore).unwrap();
        for i in 0..8 {
            feed(&mut h, i, 1.0);
        }
        let summary = h.recorder.stop_recording().unwrap();
        assert_eq!(summary.images, 2);
        assert_eq!(summary.pulses, 0);
    }

    #[test]
    fn pulse_recording_takes_one_aligned_cycle_then_stops() {
        let config = session(true);
        let mut h = harness(&config);
        // Mid-cycle when the recording starts.
        feed(&mut h, 0, 1.0);
        h.recorder.start_recording(UnsavedDecision::Ignore).unwrap();
        for i in 1..10 {
            feed(&mut h, i, 1.0);
        }
        assert!(!h.recorder.is_recording());
        assert_eq!(h.recorder.recorded_pulses(), 4);
        assert_eq!(h.recorder.recorded_images(), 1);
        let stopped = drain(&h)
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::RecordingStopped(_)))
            .count();
        assert_eq!(stopped, 1);
    }
}

//! The pipeline executor.
//!
//! Owns the session's pools and recorder, wires the three stages together
//! and drives their lifecycle:
//!
//! ```text
//! digitizer ─▶ AcquisitionFeed ─Q1─▶ PulseStage ─Q2─▶ ImageStage ─▶ events
//! ```

use std::sync::Arc;

use core_affinity::CoreId;
use flim_sensors::AcquisitionSink;
use flim_types::{PipelineEvent, ProcessingConfig, SessionConfig, CHANNEL_COUNT};
use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::accumulator::ImageAccumulator;
use crate::allocator::{BufferPool, SharedBufferPool};
use crate::data::{ProcessedPacket, RawPacket};
use crate::error::{PipelineError, PipelineResult};
use crate::events::{event_channel, publish};
use crate::processor::PulseProcessor;
use crate::queue::sync_queue;
use crate::recording::RecordingBuffer;
use crate::stage::{Outlet, StageState, StageWorker};
use crate::stages::{AcquisitionFeed, ImageStage, ProcessControl, PulseStage};
use crate::stats::{PipelineStats, StatsSnapshot};

/// Threads and channels that exist only while the pipeline runs.
struct Running {
    feed: Arc<AcquisitionFeed>,
    control: Sender<ProcessControl>,
    process: StageWorker<RawPacket>,
    visualize: StageWorker<ProcessedPacket>,
}

pub struct Pipeline {
    config: SessionConfig,
    /// Latest processing snapshot, handed to every new processing stage.
    processing: ProcessingConfig,
    probe: Option<usize>,
    stats: Arc<PipelineStats>,
    events: Sender<PipelineEvent>,
    raw_pool: SharedBufferPool<u16>,
    intensity_pool: SharedBufferPool<f32>,
    raw_copy_pool: Option<SharedBufferPool<u16>>,
    recorder: Arc<RecordingBuffer>,
    running: Option<Running>,
}

impl Pipeline {
    /// Validates `config` and allocates every buffer the session needs.
    pub fn new(config: SessionConfig) -> PipelineResult<(Self, Receiver<PipelineEvent>)> {
        config.validate()?;
        let (events, events_rx) = event_channel(config.event_capacity);
        let geometry = &config.geometry;

        let raw_pool = BufferPool::allocate("raw", config.pool_depth, geometry.frame_len())?;
        let intensity_pool = BufferPool::allocate(
            "intensity",
            config.pool_depth,
            geometry.pulse_lines() * CHANNEL_COUNT,
        )?;
        let raw_copy_pool = if config.recording.record_pulses {
            Some(BufferPool::allocate("raw-copy", config.pool_depth, geometry.frame_len())?)
        } else {
            None
        };
        let recorder = RecordingBuffer::allocate(&config, events.clone())?;

        info!(
            "Pipeline ready: {} pixels x {} lines, {} samples per pulse, pool depth {}",
            geometry.n_pixels, geometry.n_lines, geometry.n_scans, config.pool_depth
        );

        let pipeline = Self {
            processing: config.processing.clone(),
            config,
            probe: None,
            stats: Arc::new(PipelineStats::default()),
            events,
            raw_pool,
            intensity_pool,
            raw_copy_pool,
            recorder,
            running: None,
        };
        Ok((pipeline, events_rx))
    }

    /// Spawns the processing and visualization stages and returns the sink
    /// the digitizer driver should deliver frames to.
    pub fn start(&mut self) -> PipelineResult<Arc<dyn AcquisitionSink>> {
        if self.running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }
        let geometry = self.config.geometry.clone();
        let [process_core, visualize_core] = stage_cores(self.config.pin_threads);

        let (q1_tx, q1_rx) = sync_queue::<RawPacket>();
        let (q2_tx, q2_rx) = sync_queue::<ProcessedPacket>();
        let (control, control_rx) = flume::unbounded();
        if self.probe.is_some() {
            let _ = control.send(ProcessControl::Probe(self.probe));
        }

        let image_stage = ImageStage::new(
            ImageAccumulator::new(geometry.clone(), self.config.imaging.clone()),
            &geometry,
            Arc::clone(&self.recorder),
            Arc::clone(&self.stats),
            self.events.clone(),
        );
        let visualize = StageWorker::spawn(
            "visualization",
            q2_rx,
            q2_tx.stop_handle(),
            Outlet::none(),
            image_stage,
            visualize_core,
        )?;

        let pulse_stage = PulseStage::new(
            geometry.clone(),
            PulseProcessor::new(self.processing.clone())?,
            Arc::clone(&self.intensity_pool),
            self.raw_copy_pool.clone(),
            Arc::clone(&self.recorder),
            control_rx,
            Arc::clone(&self.stats),
            self.events.clone(),
        );
        let process = StageWorker::spawn(
            "processing",
            q1_rx,
            q1_tx.stop_handle(),
            Outlet::new(q2_tx),
            pulse_stage,
            process_core,
        )?;

        let feed = Arc::new(AcquisitionFeed::new(
            geometry.frame_len(),
            self.config.invert_samples,
            Arc::clone(&self.raw_pool),
            q1_tx,
            Arc::clone(&self.stats),
            self.events.clone(),
        ));

        self.running = Some(Running {
            feed: Arc::clone(&feed),
            control,
            process,
            visualize,
        });
        info!("Pipeline started");
        publish(&self.events, PipelineEvent::status("Pipeline started."));
        Ok(feed as Arc<dyn AcquisitionSink>)
    }

    /// Replaces the processing configuration. A running pipeline applies it
    /// from the next frame on.
    pub fn reconfigure(&mut self, processing: ProcessingConfig) -> PipelineResult<()> {
        processing.validate_for_width(self.config.geometry.n_scans)?;
        if let Some(running) = &self.running {
            if running.control.send(ProcessControl::Configure(processing.clone())).is_err() {
                warn!("Processing stage is gone; configuration kept for the next start");
            }
        }
        self.processing = processing;
        Ok(())
    }

    /// Publishes the processed pulse of `line` with every frame, or stops
    /// doing so with `None`.
    pub fn set_calibration_probe(&mut self, line: Option<usize>) -> PipelineResult<()> {
        let lines = self.config.geometry.pulse_lines();
        if let Some(line) = line {
            if line >= lines {
                return Err(PipelineError::InvalidInput {
                    message: format!("probe line {} out of range (frame has {} lines)", line, lines),
                });
            }
        }
        self.probe = line;
        if let Some(running) = &self.running {
            let _ = running.control.send(ProcessControl::Probe(line));
        }
        Ok(())
    }

    /// Drains and joins the stages. Frames already queued are still
    /// processed; frames delivered afterwards are ignored.
    pub fn stop(&mut self) -> PipelineResult<()> {
        let running = self.running.take().ok_or(PipelineError::NotRunning)?;
        if running.feed.is_finished() {
            debug!("Acquisition already ended the stream");
        } else {
            running.process.stop();
        }

        let process = running.process.join();
        let visualize = running.visualize.join();
        if running.feed.has_failed() {
            warn!("Acquisition ended with a digitizer error");
        }
        info!("Pipeline stopped: {:?}", self.stats.snapshot());
        publish(&self.events, PipelineEvent::Stopped);
        process.and(visualize)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Per-stage states, processing first.
    pub fn stage_states(&self) -> Option<[StageState; 2]> {
        self.running
            .as_ref()
            .map(|r| [r.process.state(), r.visualize.state()])
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn recorder(&self) -> &Arc<RecordingBuffer> {
        &self.recorder
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn processing_config(&self) -> &ProcessingConfig {
        &self.processing
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.stop() {
                warn!("Pipeline did not stop cleanly: {}", e);
            }
        }
    }
}

/// Cores for the processing and visualization threads. Core 0 is left to
/// the acquisition thread.
fn stage_cores(pin: bool) -> [Option<CoreId>; 2] {
    if !pin {
        return [None, None];
    }
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    if cores.is_empty() {
        warn!("Could not get core IDs. Cannot set thread affinity.");
        return [None, None];
    }
    let n = cores.len();
    [Some(cores[1 % n]), Some(cores[2 % n])]
}

//! In-memory recording of finished images and raw frames, and saving them.
//!
//! All memory is reserved when the buffer is allocated. While a session is
//! recording, capture calls stage a copy into a small pool and return at
//! once; a copy thread per data kind moves staged buffers into the next free
//! slot, oldest first, until the slots run out. Saving runs on its own
//! thread and never clears the recorded data, so a failed save can be
//! retried.

mod store;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use flim_types::{AveragedImage, PipelineEvent, RecordingSummary, SessionConfig, CHANNEL_COUNT};
use flume::Sender;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::allocator::{BufferPool, SharedBufferPool};
use crate::error::{PipelineError, PipelineResult};
use crate::events::publish;
use store::{CaptureLane, SlotStore};

pub use store::CaptureResult;
pub use writer::{stitch_index, SaveReport};

/// How `start_recording` treats data that was recorded but never saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsavedDecision {
    /// Start anyway, overwriting the unsaved data.
    Ignore,
    /// Throw the unsaved data away and do not start.
    Discard,
    /// Keep the unsaved data and do not start.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Discarded,
    Cancelled,
}

struct Lanes {
    images: CaptureLane<f32>,
    pulses: Option<CaptureLane<u16>>,
}

pub struct RecordingBuffer {
    config: SessionConfig,
    images: Arc<SlotStore<f32>>,
    pulses: Option<Arc<SlotStore<u16>>>,
    image_staging: SharedBufferPool<f32>,
    pulse_staging: Option<SharedBufferPool<u16>>,
    lanes: Mutex<Option<Lanes>>,
    recording: AtomicBool,
    saving: Arc<AtomicBool>,
    saved: Arc<AtomicBool>,
    /// Bumped by every started session.
    generation: AtomicU64,
    session_id: Mutex<Option<Uuid>>,
    writer: Mutex<Option<thread::JoinHandle<PipelineResult<SaveReport>>>>,
    events: Sender<PipelineEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn megabytes(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

impl RecordingBuffer {
    /// Reserves the image slots (and raw frame slots when raw pulses are
    /// recorded) for the session.
    pub fn allocate(
        config: &SessionConfig,
        events: Sender<PipelineEvent>,
    ) -> PipelineResult<Arc<Self>> {
        config.validate()?;
        let rec = &config.recording;
        let image_slot = CHANNEL_COUNT * config.geometry.image_len();
        let frame_slot = config.geometry.frame_len();

        let images = Arc::new(SlotStore::allocate(rec.image_capacity, image_slot));
        let image_staging = BufferPool::allocate("image-staging", rec.staging_depth, image_slot)?;
        publish(&events, PipelineEvent::status(format!(
            "Image writing buffer is allocated. ({:.1} MB)",
            megabytes(images.bytes_allocated())
        )));

        let (pulses, pulse_staging) = if rec.record_pulses {
            let pulses = Arc::new(SlotStore::allocate(rec.pulse_capacity, frame_slot));
            let staging = BufferPool::allocate("pulse-staging", rec.staging_depth, frame_slot)?;
            publish(&events, PipelineEvent::status(format!(
                "Pulse writing buffer is allocated. ({:.1} MB)",
                megabytes(pulses.bytes_allocated())
            )));
            (Some(pulses), Some(staging))
        } else {
            (None, None)
        };

        Ok(Arc::new(Self {
            config: config.clone(),
            images,
            pulses,
            image_staging,
            pulse_staging,
            lanes: Mutex::new(None),
            recording: AtomicBool::new(false),
            saving: Arc::new(AtomicBool::new(false)),
            saved: Arc::new(AtomicBool::new(true)),
            generation: AtomicU64::new(0),
            session_id: Mutex::new(None),
            writer: Mutex::new(None),
            events,
        }))
    }

    /// Opens a new recording session.
    pub fn start_recording(&self, decision: UnsavedDecision) -> PipelineResult<StartOutcome> {
        if self.is_saving() {
            return Err(PipelineError::SaveInProgress);
        }
        let mut lanes = lock(&self.lanes);
        if lanes.is_some() {
            return Err(PipelineError::AlreadyRecording);
        }

        if self.has_unsaved() {
            match decision {
                UnsavedDecision::Ignore => {
                    warn!("Starting a new recording over unsaved data");
                }
                UnsavedDecision::Discard => {
                    self.clear();
                    self.saved.store(true, Ordering::Release);
                    self.status("Unsaved recording discarded.");
                    return Ok(StartOutcome::Discarded);
                }
                UnsavedDecision::Cancel => return Ok(StartOutcome::Cancelled),
            }
        }

        self.clear();
        let images = CaptureLane::spawn(
            "recording-images",
            Arc::clone(&self.images),
            Arc::clone(&self.image_staging),
        )?;
        let pulses = match (&self.pulses, &self.pulse_staging) {
            (Some(store), Some(staging)) => Some(CaptureLane::spawn(
                "recording-pulses",
                Arc::clone(store),
                Arc::clone(staging),
            )?),
            _ => None,
        };
        *lanes = Some(Lanes { images, pulses });

        let id = Uuid::new_v4();
        *lock(&self.session_id) = Some(id);
        self.saved.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.recording.store(true, Ordering::Release);
        info!("Recording session {} started", id);
        publish(&self.events, PipelineEvent::RecordingStarted);
        Ok(StartOutcome::Started)
    }

    /// Closes the session once everything already staged has been stored.
    pub fn stop_recording(&self) -> PipelineResult<RecordingSummary> {
        let lanes = lock(&self.lanes).take().ok_or(PipelineError::NotRecording)?;
        self.recording.store(false, Ordering::Release);
        lanes.images.finish();
        if let Some(pulses) = lanes.pulses {
            pulses.finish();
        }

        let summary = self.summary();
        let overflow = self.images.overflow() + self.pulses.as_ref().map_or(0, |p| p.overflow());
        if overflow > 0 {
            warn!("{} captures did not fit in the recording buffer", overflow);
        }
        self.status(format!(
            "Recording finished: {} images, {} raw frames ({:.1} MB).",
            summary.images,
            summary.pulses,
            summary.megabytes()
        ));
        publish(&self.events, PipelineEvent::RecordingStopped(summary));
        Ok(summary)
    }

    /// Hands a finished image to the image copy thread.
    pub fn capture_image(&self, image: &AveragedImage) -> CaptureResult {
        let expected = self.config.geometry.image_len();
        if image.channels.iter().any(|c| c.len() != expected) {
            warn!("Ignoring image with unexpected dimensions");
            return CaptureResult::Dropped;
        }
        let lanes = lock(&self.lanes);
        match lanes.as_ref() {
            Some(lanes) => {
                let parts: [&[f32]; CHANNEL_COUNT] = std::array::from_fn(|c| image.channel(c));
                lanes.images.capture(&self.images, &parts)
            }
            None => CaptureResult::NotRecording,
        }
    }

    /// Hands a raw frame to the pulse copy thread.
    pub fn capture_pulse(&self, frame: &[u16]) -> CaptureResult {
        let (Some(store), true) = (&self.pulses, frame.len() == self.config.geometry.frame_len())
        else {
            return CaptureResult::NotRecording;
        };
        let lanes = lock(&self.lanes);
        match lanes.as_ref().and_then(|l| l.pulses.as_ref()) {
            Some(lane) => lane.capture(store, &[frame]),
            None => CaptureResult::NotRecording,
        }
    }

    /// Starts writing the recorded data to `path` on a background thread.
    /// Completion is reported with [`PipelineEvent::SaveFinished`].
    pub fn start_saving(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if self.is_recording() {
            return Err(PipelineError::AlreadyRecording);
        }
        if self.recorded_images() == 0 && self.recorded_pulses() == 0 {
            return Err(PipelineError::NothingRecorded);
        }
        let companions = writer::Companions::of(&path)?;
        companions.check_free(&path, self.recorded_pulses() > 0)?;
        if self.saving.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::SaveInProgress);
        }
        // Reap the previous save, if any.
        if let Some(handle) = lock(&self.writer).take() {
            let _ = handle.join();
        }

        let config = self.config.clone();
        let images = Arc::clone(&self.images);
        let pulses = self.pulses.clone();
        let events = self.events.clone();
        let saving = Arc::clone(&self.saving);
        let saved = Arc::clone(&self.saved);

        let spawned = thread::Builder::new()
            .name("recording-writer".to_string())
            .spawn(move || {
                let job = writer::SaveJob {
                    path: &path,
                    config: &config,
                    images: &images,
                    pulses: pulses.as_deref(),
                    events: &events,
                };
                let result = job.run();
                match &result {
                    Ok(report) => {
                        saved.store(true, Ordering::Release);
                        publish(&events, PipelineEvent::status(format!(
                            "Saved {} images and {} raw frames to {:?}.",
                            report.images, report.pulses, path
                        )));
                        publish(&events, PipelineEvent::SaveFinished { success: true });
                    }
                    Err(e) => {
                        error!("Saving recording to {:?} failed: {}", path, e);
                        publish(&events, PipelineEvent::error(format!(
                            "Failed to save recording: {}",
                            e
                        )));
                        publish(&events, PipelineEvent::SaveFinished { success: false });
                    }
                }
                saving.store(false, Ordering::Release);
                result
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.writer) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.saving.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Blocks until the current save, if any, has finished and returns its
    /// result.
    pub fn wait_for_save(&self) -> PipelineResult<Option<SaveReport>> {
        let handle = lock(&self.writer).take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| PipelineError::RuntimeError {
                    stage_name: "recording-writer".to_string(),
                    message: "writer thread panicked".to_string(),
                })?
                .map(Some),
            None => Ok(None),
        }
    }

    fn clear(&self) {
        self.images.clear();
        if let Some(pulses) = &self.pulses {
            pulses.clear();
        }
    }

    fn status(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        publish(&self.events, PipelineEvent::status(text));
    }

    pub fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            images: self.recorded_images(),
            pulses: self.recorded_pulses(),
            bytes: self.images.bytes_used() + self.pulses.as_ref().map_or(0, |p| p.bytes_used()),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Whether raw frames are captured alongside images.
    pub fn records_pulses(&self) -> bool {
        self.pulses.is_some()
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    /// True once the current data has been written, or when nothing was
    /// recorded since.
    pub fn is_saved(&self) -> bool {
        self.saved.load(Ordering::Acquire)
    }

    pub fn has_unsaved(&self) -> bool {
        !self.is_saved() && (self.recorded_images() > 0 || self.recorded_pulses() > 0)
    }

    pub fn recorded_images(&self) -> usize {
        self.images.len()
    }

    pub fn recorded_pulses(&self) -> usize {
        self.pulses.as_ref().map_or(0, |p| p.len())
    }

    pub fn image_capacity(&self) -> usize {
        self.images.capacity()
    }

    /// Changes with every started session.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        *lock(&self.session_id)
    }
}

impl Drop for RecordingBuffer {
    fn drop(&mut self) {
        if let Some(lanes) = lock(&self.lanes).take() {
            lanes.images.finish();
            if let Some(pulses) = lanes.pulses {
                pulses.finish();
            }
        }
        if let Some(handle) = lock(&self.writer).take() {
            let _ = handle.join();
        }
    }
}

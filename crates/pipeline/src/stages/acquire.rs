//! Entry point of the data plane: the digitizer callback.
//!
//! The feed runs on the driver's thread. It copies each frame into a raw
//! buffer and queues it for processing; it never blocks, so a full pool
//! means the frame is dropped. A digitizer error ends the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flim_sensors::AcquisitionSink;
use flim_types::{PipelineEvent, RawFrame, SAMPLE_FULL_SCALE};
use flume::Sender;
use tracing::{debug, error, info, warn};

use crate::allocator::SharedBufferPool;
use crate::data::RawPacket;
use crate::events::publish;
use crate::queue::{Closed, QueueSender};
use crate::stats::{DropPolicy, PipelineStats};

const INVERSION_LEVEL: u16 = SAMPLE_FULL_SCALE as u16;

/// Copies digitizer frames into queue Q1.
pub struct AcquisitionFeed {
    frame_len: usize,
    invert: bool,
    policy: DropPolicy,
    pool: SharedBufferPool<u16>,
    sender: QueueSender<RawPacket>,
    stats: Arc<PipelineStats>,
    events: Sender<PipelineEvent>,
    failed: AtomicBool,
}

impl AcquisitionFeed {
    pub fn new(
        frame_len: usize,
        invert: bool,
        pool: SharedBufferPool<u16>,
        sender: QueueSender<RawPacket>,
        stats: Arc<PipelineStats>,
        events: Sender<PipelineEvent>,
    ) -> Self {
        Self {
            frame_len,
            invert,
            policy: DropPolicy::default(),
            pool,
            sender,
            stats,
            events,
            failed: AtomicBool::new(false),
        }
    }

    /// Whether the driver reported an error during this acquisition.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Whether the stop sentinel has been queued into Q1.
    pub fn is_finished(&self) -> bool {
        self.sender.is_stopped()
    }
}

impl AcquisitionSink for AcquisitionFeed {
    fn on_frame_acquired(&self, frame: &RawFrame<'_>) {
        if self.sender.is_stopped() {
            return;
        }
        if frame.len() != self.frame_len {
            self.stats.frame_rejected();
            warn!(
                "Rejecting frame {}: {} samples, expected {}",
                frame.index,
                frame.len(),
                self.frame_len
            );
            return;
        }

        let Some(mut buffer) = self.pool.try_acquire() else {
            self.stats.acquisition_dropped();
            debug!(
                "No free raw buffer; frame {} dropped ({:?})",
                frame.index, self.policy
            );
            return;
        };

        if self.invert {
            for (dst, &src) in buffer.iter_mut().zip(frame.samples) {
                *dst = INVERSION_LEVEL.saturating_sub(src);
            }
        } else {
            buffer.copy_from_slice(frame.samples);
        }

        let packet = RawPacket {
            frame_index: frame.index,
            samples: buffer,
        };
        match self.sender.push(packet) {
            Ok(()) => self.stats.frame_acquired(),
            Err(Closed(packet)) => {
                debug!("Q1 closed; frame {} discarded", packet.frame_index);
            }
        }
    }

    fn on_acquisition_stopped(&self) {
        if self.sender.is_stopped() {
            debug!("Acquisition stopped after the stream had already ended");
            return;
        }
        if self.sender.stop() {
            info!("Acquisition stopped; draining pipeline");
        }
    }

    fn on_status_message(&self, text: &str, is_error: bool) {
        if !is_error {
            info!("Digitizer: {}", text);
            publish(&self.events, PipelineEvent::status(text));
            return;
        }
        self.failed.store(true, Ordering::Release);
        error!("Digitizer: {}", text);
        publish(&self.events, PipelineEvent::error(text));
        if self.sender.stop() {
            info!("Acquisition failed; draining pipeline");
        }
    }
}

//! Publishing to the host's event channel.
//!
//! The channel is bounded. Per-frame display updates only use the part of it
//! above a reserve kept for lifecycle and error events, and are dropped when
//! the host falls behind. Publishing never blocks a stage.

use flim_types::PipelineEvent;
use flume::{Receiver, Sender, TrySendError};
use tracing::warn;

/// Creates the pipeline's event channel.
pub fn event_channel(capacity: usize) -> (Sender<PipelineEvent>, Receiver<PipelineEvent>) {
    flume::bounded(capacity)
}

/// Queued events above which display updates are dropped.
fn display_limit(capacity: usize) -> usize {
    capacity - capacity / 4
}

/// Queues a per-frame display update (intensities, progress, images,
/// calibration pulses). Returns false if it was dropped because the host is
/// behind.
pub fn publish_display(events: &Sender<PipelineEvent>, event: PipelineEvent) -> bool {
    if let Some(capacity) = events.capacity() {
        if events.len() >= display_limit(capacity) {
            return false;
        }
    }
    !matches!(events.try_send(event), Err(TrySendError::Full(_)))
}

/// Queues a lifecycle or error event into the reserve. Only a host that has
/// let the whole reserve fill up loses one.
pub fn publish(events: &Sender<PipelineEvent>, event: PipelineEvent) {
    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        warn!("Event channel full; {} event dropped", event.event_type_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_updates_leave_the_reserve_free() {
        let (tx, rx) = event_channel(8);
        let queued = (0..20)
            .filter(|_| publish_display(&tx, PipelineEvent::Progress { accumulation: 1, averaging: 1 }))
            .count();
        assert_eq!(queued, 6);

        publish(&tx, PipelineEvent::RecordingStarted);
        publish(&tx, PipelineEvent::Stopped);
        assert_eq!(rx.len(), 8);
        let last = rx.try_iter().last();
        assert!(matches!(last, Some(PipelineEvent::Stopped)));
    }

    #[test]
    fn unbounded_channels_never_drop() {
        let (tx, rx) = flume::unbounded();
        for _ in 0..1000 {
            assert!(publish_display(&tx, PipelineEvent::Progress { accumulation: 1, averaging: 1 }));
        }
        assert_eq!(rx.len(), 1000);
    }

    #[test]
    fn a_full_reserve_drops_without_blocking() {
        let (tx, rx) = event_channel(4);
        for _ in 0..6 {
            publish(&tx, PipelineEvent::Stopped);
        }
        assert_eq!(rx.len(), 4);
    }
}

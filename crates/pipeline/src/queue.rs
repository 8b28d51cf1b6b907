//! Single-producer/single-consumer work queues between stages.
//!
//! A queue carries work items followed by at most one stop sentinel. The
//! consumer blocks in [`QueueReceiver::pop`]; everything on the producer side
//! is non-blocking. The sentinel can be pushed either by the producer
//! ([`QueueSender::finish`]) or by whoever owns the consuming stage
//! ([`StopHandle::stop`]); a flag shared by both guarantees it is enqueued
//! only once. Once the consumer has taken the sentinel, anything still
//! queued behind it is dropped so pooled buffers go home.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender};
use tracing::{debug, warn};

/// What a consumer gets out of the queue.
#[derive(Debug, PartialEq)]
pub enum Work<T> {
    Item(T),
    /// No more items will follow.
    Stop,
}

/// Returned by [`QueueSender::push`] once the sentinel has been sent or the
/// consumer is gone. Hands the rejected item back.
pub struct Closed<T>(pub T);

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

/// Creates a connected queue.
pub fn sync_queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = flume::unbounded();
    let stopped = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));
    (
        QueueSender {
            tx,
            backlog: rx.clone(),
            stopped: Arc::clone(&stopped),
            closed: Arc::clone(&closed),
        },
        QueueReceiver { rx, stopped, closed },
    )
}

/// Producer half. Not `Clone`: each queue has exactly one producer.
pub struct QueueSender<T> {
    tx: Sender<Work<T>>,
    /// Used only to empty the queue after the consumer has finished.
    backlog: Receiver<Work<T>>,
    stopped: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl<T> QueueSender<T> {
    /// Enqueues an item without blocking.
    pub fn push(&self, item: T) -> Result<(), Closed<T>> {
        if self.stopped.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return Err(Closed(item));
        }
        self.tx.send(Work::Item(item)).map_err(|e| match e.0 {
            Work::Item(item) => Closed(item),
            Work::Stop => unreachable!("push only sends items"),
        })?;
        // The consumer may have finished between the check and the send.
        if self.closed.load(Ordering::SeqCst) {
            discard_backlog(&self.backlog);
        }
        Ok(())
    }

    /// Pushes the sentinel unless it was already sent. Returns whether this
    /// call enqueued it.
    pub fn stop(&self) -> bool {
        push_sentinel(&self.tx, &self.stopped)
    }

    /// Ends the stream: pushes the sentinel and gives up the producer.
    pub fn finish(self) -> bool {
        self.stop()
    }

    /// A handle that can push this queue's sentinel from another owner.
    pub fn stop_handle(&self) -> StopHandle<T> {
        StopHandle {
            tx: self.tx.clone(),
            stopped: Arc::clone(&self.stopped),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Pushes the sentinel into a queue on behalf of the stage that consumes it.
pub struct StopHandle<T> {
    tx: Sender<Work<T>>,
    stopped: Arc<AtomicBool>,
}

impl<T> StopHandle<T> {
    /// Same contract as [`QueueSender::stop`].
    pub fn stop(&self) -> bool {
        push_sentinel(&self.tx, &self.stopped)
    }
}

impl<T> Clone for StopHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stopped: Arc::clone(&self.stopped),
        }
    }
}

fn push_sentinel<T>(tx: &Sender<Work<T>>, stopped: &AtomicBool) -> bool {
    if stopped.swap(true, Ordering::AcqRel) {
        warn!("Stop sentinel already queued; ignoring second stop request");
        return false;
    }
    if tx.send(Work::Stop).is_err() {
        debug!("Consumer gone before the stop sentinel was delivered");
        return false;
    }
    true
}

fn discard_backlog<T>(rx: &Receiver<Work<T>>) {
    let discarded = rx.drain().filter(|work| matches!(work, Work::Item(_))).count();
    if discarded > 0 {
        debug!("Discarded {} items queued behind the stop sentinel", discarded);
    }
}

/// Consumer half.
pub struct QueueReceiver<T> {
    rx: Receiver<Work<T>>,
    stopped: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl<T> QueueReceiver<T> {
    /// Blocks until an item or the sentinel arrives. A queue whose producers
    /// have all disappeared without a sentinel also reads as `Stop`.
    pub fn pop(&self) -> Work<T> {
        match self.rx.recv() {
            Ok(Work::Item(item)) => Work::Item(item),
            Ok(Work::Stop) => {
                self.close();
                Work::Stop
            }
            Err(_) => {
                debug!("Queue producers dropped without a stop sentinel");
                self.close();
                Work::Stop
            }
        }
    }

    /// Refuses further items and drops whatever is still queued.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        discard_backlog(&self.rx);
    }

    /// Whether the sentinel has been pushed (it may still be queued).
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Drop for QueueReceiver<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferPool;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn sentinel_follows_items() {
        let (tx, rx) = sync_queue();
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        assert!(tx.finish());
        assert_eq!(rx.pop(), Work::Item(1));
        assert_eq!(rx.pop(), Work::Item(2));
        assert_eq!(rx.pop(), Work::Stop);
    }

    #[test]
    fn sentinel_is_enqueued_once() {
        let (tx, rx) = sync_queue::<u32>();
        let handle = tx.stop_handle();
        assert!(handle.stop());
        assert!(!tx.stop());
        assert!(!handle.clone().stop());
        assert_eq!(rx.len(), 1);
        assert!(matches!(tx.push(5), Err(Closed(5))));
    }

    #[test]
    fn items_behind_the_sentinel_go_back_to_their_pool() {
        let pool = BufferPool::<u16>::allocate("queue", 2, 1).unwrap();
        let (tx, rx) = sync_queue();
        tx.push(pool.try_acquire().unwrap()).unwrap();
        assert!(tx.stop());
        // A push that passed its check just before the sentinel went in.
        let late = pool.try_acquire().unwrap();
        assert!(tx.tx.send(Work::Item(late)).is_ok());
        assert_eq!(pool.available(), 0);

        assert!(matches!(rx.pop(), Work::Item(_)));
        assert!(matches!(rx.pop(), Work::Stop));
        assert_eq!(pool.available(), 2);
        assert!(rx.is_empty());
    }

    #[test]
    fn push_after_the_consumer_finished_is_refused() {
        let (tx, rx) = sync_queue::<u32>();
        drop(rx);
        assert!(matches!(tx.push(3), Err(Closed(3))));
        assert!(tx.is_empty());
    }

    #[test]
    fn dropped_producer_reads_as_stop() {
        let (tx, rx) = sync_queue::<u32>();
        drop(tx);
        assert_eq!(rx.pop(), Work::Stop);
    }

    #[test]
    fn pop_blocks_until_item_arrives() {
        let (tx, rx) = sync_queue();
        let consumer = thread::spawn(move || rx.pop());
        thread::sleep(std::time::Duration::from_millis(20));
        tx.push(42u32).unwrap();
        assert_eq!(consumer.join().unwrap(), Work::Item(42));
    }

    proptest! {
        #[test]
        fn items_arrive_in_push_order(items in proptest::collection::vec(any::<u32>(), 0..256)) {
            let (tx, rx) = sync_queue();
            let expected = items.clone();
            let producer = thread::spawn(move || {
                for item in items {
                    tx.push(item).unwrap();
                }
                tx.finish();
            });
            let mut received = Vec::new();
            while let Work::Item(item) = rx.pop() {
                received.push(item);
            }
            producer.join().unwrap();
            prop_assert_eq!(received, expected);
        }
    }
}

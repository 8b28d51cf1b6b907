//! Pre-allocated slot storage and the copy threads that fill it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::allocator::{PooledBuffer, SharedBufferPool};
use crate::queue::{sync_queue, QueueSender, Work};

/// Outcome of handing data to the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureResult {
    Captured,
    /// No recording session is active for this kind of data.
    NotRecording,
    /// The recording pool has no free slot left.
    Full,
    /// The copy thread is behind and no staging buffer was free.
    Dropped,
}

/// A fixed number of equally sized slots, filled in order.
///
/// A capture claims its slot with [`SlotStore::try_reserve`] before it is
/// staged, so `reserved` counts stored and in-flight captures in one number.
pub(crate) struct SlotStore<T> {
    slots: Mutex<Vec<Vec<T>>>,
    count: AtomicUsize,
    reserved: AtomicUsize,
    overflow: AtomicUsize,
    capacity: usize,
    slot_len: usize,
}

impl<T: Copy + Default> SlotStore<T> {
    pub(crate) fn allocate(capacity: usize, slot_len: usize) -> Self {
        let slots = (0..capacity).map(|_| vec![T::default(); slot_len]).collect();
        Self {
            slots: Mutex::new(slots),
            count: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            overflow: AtomicUsize::new(0),
            capacity,
            slot_len,
        }
    }

    /// Copies `data` into the next free slot. Returns false when full.
    pub(crate) fn store(&self, data: &[T]) -> bool {
        let mut slots = self.lock();
        let n = self.count.load(Ordering::Acquire);
        if n >= self.capacity {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        slots[n].copy_from_slice(data);
        self.count.store(n + 1, Ordering::Release);
        true
    }
}

impl<T> SlotStore<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims a slot for a capture on its way to the copy thread. Returns
    /// false, counting an overflow, when every slot is taken.
    pub(crate) fn try_reserve(&self) -> bool {
        let claimed = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if !claimed {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    /// Gives back a slot claimed for a capture that was never staged.
    pub(crate) fn release_reservation(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn clear(&self) {
        let _slots = self.lock();
        self.count.store(0, Ordering::Release);
        self.reserved.store(0, Ordering::Release);
        self.overflow.store(0, Ordering::Relaxed);
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub(crate) fn overflow(&self) -> usize {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Bytes held by the filled slots.
    pub(crate) fn bytes_used(&self) -> usize {
        self.len() * self.slot_len * std::mem::size_of::<T>()
    }

    pub(crate) fn bytes_allocated(&self) -> usize {
        self.capacity * self.slot_len * std::mem::size_of::<T>()
    }

    /// Runs `f` over the filled slots, oldest first.
    pub(crate) fn with_filled<R>(&self, f: impl FnOnce(&[Vec<T>]) -> R) -> R {
        let slots = self.lock();
        let n = self.len().min(slots.len());
        f(&slots[..n])
    }
}

/// A staging pool plus the thread copying staged buffers into a store.
pub(crate) struct CaptureLane<T> {
    staging: SharedBufferPool<T>,
    sender: QueueSender<PooledBuffer<T>>,
    thread: thread::JoinHandle<()>,
}

impl<T: Copy + Default + Send + Sync + 'static> CaptureLane<T> {
    pub(crate) fn spawn(
        name: &str,
        store: Arc<SlotStore<T>>,
        staging: SharedBufferPool<T>,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = sync_queue::<PooledBuffer<T>>();
        let thread_name = name.to_string();
        let thread = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            let mut stored = 0usize;
            while let Work::Item(buffer) = receiver.pop() {
                if store.store(&buffer) {
                    stored += 1;
                } else {
                    debug!("'{}' is full; discarding capture", thread_name);
                }
            }
            debug!("'{}' finished after {} captures", thread_name, stored);
        })?;
        Ok(Self {
            staging,
            sender,
            thread,
        })
    }

    /// Stages a copy of `data` for the copy thread without blocking.
    pub(crate) fn capture(&self, store: &SlotStore<T>, parts: &[&[T]]) -> CaptureResult {
        if !store.try_reserve() {
            return CaptureResult::Full;
        }
        let Some(mut buffer) = self.staging.try_acquire() else {
            store.release_reservation();
            return CaptureResult::Dropped;
        };
        let mut offset = 0;
        for part in parts {
            buffer[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        match self.sender.push(buffer) {
            Ok(()) => CaptureResult::Captured,
            Err(_) => {
                store.release_reservation();
                CaptureResult::NotRecording
            }
        }
    }

    /// Ends the lane after every staged buffer has been stored.
    pub(crate) fn finish(self) {
        self.sender.finish();
        if self.thread.join().is_err() {
            warn!("Recording copy thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferPool;

    #[test]
    fn store_fills_in_order_until_full() {
        let store = SlotStore::<u16>::allocate(2, 3);
        assert!(store.store(&[1, 2, 3]));
        assert!(store.store(&[4, 5, 6]));
        assert!(!store.store(&[7, 8, 9]));
        assert_eq!(store.len(), 2);
        assert_eq!(store.overflow(), 1);
        store.with_filled(|slots| {
            assert_eq!(slots[0], vec![1, 2, 3]);
            assert_eq!(slots[1], vec![4, 5, 6]);
        });
        assert_eq!(store.bytes_used(), 12);

        store.clear();
        assert_eq!(store.len(), 0);
        store.with_filled(|slots| assert!(slots.is_empty()));
    }

    #[test]
    fn lane_copies_everything_staged_before_finish() {
        let store = Arc::new(SlotStore::<f32>::allocate(10, 4));
        let staging = BufferPool::<f32>::allocate("staging", 10, 4).unwrap();
        let lane = CaptureLane::spawn("lane", Arc::clone(&store), Arc::clone(&staging)).unwrap();
        for i in 0..5 {
            let a = [i as f32, 0.0];
            let b = [1.0, 2.0];
            assert_eq!(lane.capture(&store, &[&a, &b]), CaptureResult::Captured);
        }
        lane.finish();
        assert_eq!(store.len(), 5);
        assert_eq!(staging.available(), 10);
        store.with_filled(|slots| {
            let firsts: Vec<f32> = slots.iter().map(|s| s[0]).collect();
            assert_eq!(firsts, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
            assert_eq!(slots[4], vec![4.0, 0.0, 1.0, 2.0]);
        });
    }

    #[test]
    fn lane_reports_full_store() {
        let store = Arc::new(SlotStore::<u16>::allocate(1, 2));
        let staging = BufferPool::<u16>::allocate("staging", 4, 2).unwrap();
        let lane = CaptureLane::spawn("lane", Arc::clone(&store), staging).unwrap();
        assert_eq!(lane.capture(&store, &[&[1, 2]]), CaptureResult::Captured);
        // Either still staged or already stored: both count against capacity.
        assert_eq!(lane.capture(&store, &[&[3, 4]]), CaptureResult::Full);
        lane.finish();
        assert_eq!(store.len(), 1);
        assert_eq!(store.overflow(), 1);
    }

    #[test]
    fn reservations_cap_the_store() {
        let store = SlotStore::<u16>::allocate(2, 1);
        assert!(store.try_reserve());
        assert!(store.try_reserve());
        assert!(!store.try_reserve());
        store.release_reservation();
        assert!(store.try_reserve());
        store.clear();
        assert!(store.try_reserve());
    }

    #[test]
    fn a_dropped_capture_gives_its_slot_back() {
        let store = Arc::new(SlotStore::<u16>::allocate(2, 2));
        let staging = BufferPool::<u16>::allocate("staging", 1, 2).unwrap();
        let lane = CaptureLane::spawn("lane", Arc::clone(&store), Arc::clone(&staging)).unwrap();

        let held = staging.try_acquire();
        assert_eq!(lane.capture(&store, &[&[1, 2]]), CaptureResult::Dropped);
        drop(held);

        // Every capture that fits is accepted, however far the copy thread lags.
        for value in [3u16, 5] {
            let mut result = lane.capture(&store, &[&[value, value + 1]]);
            while result == CaptureResult::Dropped {
                std::thread::yield_now();
                result = lane.capture(&store, &[&[value, value + 1]]);
            }
            assert_eq!(result, CaptureResult::Captured);
        }
        assert_eq!(lane.capture(&store, &[&[7, 8]]), CaptureResult::Full);
        lane.finish();
        store.with_filled(|slots| assert_eq!(slots, &[vec![3, 4], vec![5, 6]]));
    }
}

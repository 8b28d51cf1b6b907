//! Fixed-capacity buffer pools for the pipeline hot path.
//!
//! Every buffer a stage hands downstream is carved out of a pool allocated
//! once per session. Taking a buffer never allocates and never blocks: an
//! empty pool simply yields `None` and the caller drops its frame. A loaned
//! buffer is a [`PooledBuffer`] that goes back to its pool when dropped, so
//! a buffer cannot leak or be returned twice.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use flim_types::ConfigError;
use tracing::{debug, warn};

/// A shared, thread-safe handle to a `BufferPool`.
pub type SharedBufferPool<T> = Arc<BufferPool<T>>;

/// A pool of equally sized, pre-allocated buffers.
///
/// `available() + in_flight() == capacity()` holds at every quiescent point.
pub struct BufferPool<T> {
    name: &'static str,
    free: ArrayQueue<Vec<T>>,
    buffer_len: usize,
}

impl<T: Clone + Default + Send> BufferPool<T> {
    /// Pre-allocates `depth` zeroed buffers of `buffer_len` elements.
    pub fn allocate(
        name: &'static str,
        depth: usize,
        buffer_len: usize,
    ) -> Result<SharedBufferPool<T>, ConfigError> {
        if depth == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if buffer_len == 0 {
            return Err(ConfigError::EmptyBuffer);
        }
        let free = ArrayQueue::new(depth);
        for _ in 0..depth {
            // Cannot fail: the queue was sized for exactly `depth` buffers.
            let _ = free.push(vec![T::default(); buffer_len]);
        }
        debug!(
            "Allocated pool '{}': {} buffers of {} elements",
            name, depth, buffer_len
        );
        Ok(Arc::new(Self {
            name,
            free,
            buffer_len,
        }))
    }
}

impl<T> BufferPool<T> {
    /// Takes a free buffer without blocking. `None` means the pool is
    /// exhausted.
    ///
    /// The buffer still holds whatever its previous user wrote; callers
    /// overwrite it completely.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBuffer<T>> {
        self.free.pop().map(|vec| PooledBuffer {
            vec,
            pool: Arc::clone(self),
        })
    }

    /// Returns a buffer to its pool. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer<T>) {
        drop(buffer);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    fn recycle(&self, vec: Vec<T>) {
        if self.free.push(vec).is_err() {
            warn!("Pool '{}' received more buffers than it owns", self.name);
        }
    }
}

impl<T> fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("buffer_len", &self.buffer_len)
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`]; returns itself to the pool on
/// drop. Derefs to a fixed-length slice.
pub struct PooledBuffer<T> {
    vec: Vec<T>,
    pool: SharedBufferPool<T>,
}

impl<T> PooledBuffer<T> {
    pub fn pool(&self) -> &SharedBufferPool<T> {
        &self.pool
    }
}

impl<T> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        self.pool.recycle(std::mem::take(&mut self.vec));
    }
}

impl<T> Deref for PooledBuffer<T> {
    type Target = [T];
    fn deref(&self) -> &Self::Target {
        &self.vec
    }
}

impl<T> DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.vec
    }
}

impl<T> fmt::Debug for PooledBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("pool", &self.pool.name)
            .field("len", &self.vec.len())
            .finish()
    }
}

//! Stage workers: one thread per stage, driven by a blocking input queue.
//!
//! A [`StageWorker`] knows nothing about the data it moves. It pops its
//! input queue, hands every item to a [`StageHandler`], and on the stop
//! sentinel lets the handler flush, forwards the sentinel downstream and
//! exits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult, StageError};
use crate::queue::{Closed, QueueReceiver, QueueSender, StopHandle, Work};

/// Stage runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    /// Stage thread is not running
    Idle = 0,
    /// Stage is consuming its input queue
    Running = 1,
    /// Stop requested; draining the items queued before the sentinel
    Stopping = 2,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StageState::Running,
            2 => StageState::Stopping,
            _ => StageState::Idle,
        }
    }
}

/// Domain logic of a stage.
pub trait StageHandler: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Handles one item. Errors are logged and the stage keeps running.
    fn on_data(&mut self, item: Self::Input, outlet: &Outlet<Self::Output>) -> Result<(), StageError>;

    /// Called once after the sentinel, before it is forwarded.
    fn on_stop(&mut self, _outlet: &Outlet<Self::Output>) {}
}

/// The downstream side of a stage: a queue, or nothing for a sink.
pub struct Outlet<T> {
    sender: Option<QueueSender<T>>,
}

impl<T> Outlet<T> {
    pub fn new(sender: QueueSender<T>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// An outlet for a terminal stage.
    pub fn none() -> Self {
        Self { sender: None }
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_some()
    }

    pub fn push(&self, item: T) -> Result<(), StageError> {
        match &self.sender {
            Some(sender) => sender.push(item).map_err(|Closed(_)| StageError::QueueClosed),
            None => Ok(()),
        }
    }

    fn finish(self) {
        if let Some(sender) = self.sender {
            sender.finish();
        }
    }
}

/// A handle to a running stage thread.
pub struct StageWorker<I> {
    name: String,
    state: Arc<AtomicU8>,
    stop: StopHandle<I>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl<I: Send + 'static> StageWorker<I> {
    /// Spawns the stage thread. `stop` must belong to the same queue as
    /// `input`.
    pub fn spawn<H>(
        name: &str,
        input: QueueReceiver<I>,
        stop: StopHandle<I>,
        outlet: Outlet<H::Output>,
        mut handler: H,
        core: Option<core_affinity::CoreId>,
    ) -> PipelineResult<Self>
    where
        H: StageHandler<Input = I>,
    {
        let state = Arc::new(AtomicU8::new(StageState::Running as u8));
        let thread_state = Arc::clone(&state);
        let thread_name = name.to_string();

        let thread_handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                if let Some(core_id) = core {
                    if core_affinity::set_for_current(core_id) {
                        info!("Pinned stage '{}' to core {:?}", thread_name, core_id);
                    } else {
                        warn!("Failed to pin stage '{}' to core {:?}", thread_name, core_id);
                    }
                }
                debug!("Stage '{}' started", thread_name);

                loop {
                    match input.pop() {
                        Work::Item(item) => {
                            if let Err(e) = handler.on_data(item, &outlet) {
                                error!("Stage '{}' failed to process an item: {}", thread_name, e);
                            }
                        }
                        Work::Stop => break,
                    }
                }

                handler.on_stop(&outlet);
                outlet.finish();
                thread_state.store(StageState::Idle as u8, Ordering::Release);
                debug!("Stage '{}' stopped", thread_name);
            })?;

        Ok(Self {
            name: name.to_string(),
            state,
            stop,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Pushes the sentinel into the stage's input queue. Items queued before
    /// it are still processed.
    pub fn stop(&self) {
        let _ = self.state.compare_exchange(
            StageState::Running as u8,
            StageState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.stop.stop();
    }

    /// Waits for the stage thread to exit.
    pub fn join(mut self) -> PipelineResult<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> PipelineResult<()> {
        match self.thread_handle.take() {
            Some(handle) => handle.join().map_err(|_| PipelineError::RuntimeError {
                stage_name: self.name.clone(),
                message: "stage thread panicked".to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl<I> Drop for StageWorker<I> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            warn!("Stage '{}' dropped while running; stopping it", self.name);
            self.stop.stop();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::sync_queue;
    use std::sync::Mutex;

    struct Doubler {
        seen: Arc<Mutex<Vec<u32>>>,
        stopped: Arc<Mutex<bool>>,
    }

    impl StageHandler for Doubler {
        type Input = u32;
        type Output = u32;

        fn on_data(&mut self, item: u32, outlet: &Outlet<u32>) -> Result<(), StageError> {
            self.seen.lock().unwrap().push(item);
            if item == 13 {
                return Err(StageError::BadInput("unlucky".into()));
            }
            outlet.push(item * 2)
        }

        fn on_stop(&mut self, outlet: &Outlet<u32>) {
            *self.stopped.lock().unwrap() = true;
            let _ = outlet.push(0);
        }
    }

    fn doubler() -> (Doubler, Arc<Mutex<Vec<u32>>>, Arc<Mutex<bool>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(Mutex::new(false));
        (
            Doubler {
                seen: Arc::clone(&seen),
                stopped: Arc::clone(&stopped),
            },
            seen,
            stopped,
        )
    }

    #[test]
    fn sentinel_drains_and_propagates() {
        let (in_tx, in_rx) = sync_queue();
        let (out_tx, out_rx) = sync_queue();
        let (handler, seen, stopped) = doubler();
        let worker = StageWorker::spawn(
            "doubler",
            in_rx,
            in_tx.stop_handle(),
            Outlet::new(out_tx),
            handler,
            None,
        )
        .unwrap();

        for i in [1, 13, 2] {
            in_tx.push(i).unwrap();
        }
        in_tx.finish();

        let mut out = Vec::new();
        while let Work::Item(v) = out_rx.pop() {
            out.push(v);
        }
        worker.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 13, 2]);
        assert_eq!(out, vec![2, 4, 0]);
        assert!(*stopped.lock().unwrap());
    }

    #[test]
    fn stop_moves_through_stopping_to_idle() {
        let (in_tx, in_rx) = sync_queue::<u32>();
        let (handler, _, stopped) = doubler();
        let worker = StageWorker::spawn(
            "sink",
            in_rx,
            in_tx.stop_handle(),
            Outlet::none(),
            handler,
            None,
        )
        .unwrap();
        assert_eq!(worker.state(), StageState::Running);

        worker.stop();
        // A producer finishing after the owner stopped must not enqueue a second sentinel.
        assert!(!in_tx.finish());

        let state = worker.state();
        assert!(state == StageState::Stopping || state == StageState::Idle);
        let name = worker.name().to_string();
        worker.join().unwrap();
        assert_eq!(name, "sink");
        assert!(*stopped.lock().unwrap());
    }
}

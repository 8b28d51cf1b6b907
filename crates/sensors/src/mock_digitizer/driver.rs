use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flim_types::{RawFrame, ScanGeometry};
use log::{debug, error, info, warn};

use super::mock_data_generator::{PulseGenerator, PulseShape};
use crate::types::{AcquisitionSink, Digitizer, DriverError, DriverStatus};

/// Settings of the simulated digitizer.
#[derive(Debug, Clone)]
pub struct MockDigitizerConfig {
    pub geometry: ScanGeometry,
    pub shape: PulseShape,
    /// Pause between frames; zero streams as fast as the sink accepts.
    pub frame_period: Duration,
    /// Stop on its own after this many frames.
    pub frame_limit: Option<u64>,
    /// Simulate a hardware fault instead of delivering this frame index.
    pub fail_at_frame: Option<u64>,
    pub seed: u64,
}

impl Default for MockDigitizerConfig {
    fn default() -> Self {
        Self {
            geometry: ScanGeometry::default(),
            shape: PulseShape::default(),
            frame_period: Duration::from_millis(10),
            frame_limit: None,
            fail_at_frame: None,
            seed: 0x5eed,
        }
    }
}

/// A digitizer that synthesizes pulse frames on its own thread instead of
/// talking to hardware.
pub struct MockDigitizer {
    config: MockDigitizerConfig,
    status: Arc<Mutex<DriverStatus>>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockDigitizer {
    pub fn new(config: MockDigitizerConfig) -> Result<Self, DriverError> {
        config.geometry.validate()?;
        config
            .shape
            .windows
            .validate_for_width(config.geometry.n_scans)?;
        info!(
            "MockDigitizer created: {} samples per frame, period {:?}",
            config.geometry.frame_len(),
            config.frame_period
        );
        Ok(Self {
            config,
            status: Arc::new(Mutex::new(DriverStatus::NotInitialized)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    fn set_status(status: &Mutex<DriverStatus>, value: DriverStatus) {
        *status.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn acquisition_loop(
        config: MockDigitizerConfig,
        mut generator: PulseGenerator,
        sink: Arc<dyn AcquisitionSink>,
        stop_flag: Arc<AtomicBool>,
        status: Arc<Mutex<DriverStatus>>,
    ) {
        let mut frame = vec![0u16; config.geometry.frame_len()];
        let mut index = 0u64;
        sink.on_status_message("Acquisition started.", false);

        while !stop_flag.load(Ordering::Acquire) {
            if config.fail_at_frame == Some(index) {
                let text = format!("Simulated digitizer fault at frame {}.", index);
                error!("{}", text);
                Self::set_status(&status, DriverStatus::Error(text.clone()));
                sink.on_status_message(&text, true);
                break;
            }
            if config.frame_limit.is_some_and(|limit| index >= limit) {
                debug!("Frame limit of {} reached", index);
                break;
            }

            generator.fill_frame(index, &mut frame);
            sink.on_frame_acquired(&RawFrame::new(index, &frame));
            index += 1;

            if !config.frame_period.is_zero() {
                thread::sleep(config.frame_period);
            }
        }

        {
            let mut guard = status.lock().unwrap_or_else(PoisonError::into_inner);
            if *guard == DriverStatus::Running {
                *guard = DriverStatus::Stopped;
            }
        }
        info!("Mock acquisition ended after {} frames", index);
        sink.on_acquisition_stopped();
    }
}

impl Digitizer for MockDigitizer {
    fn initialize(&mut self) -> Result<(), DriverError> {
        // No hardware to initialize for the mock driver
        Self::set_status(&self.status, DriverStatus::Stopped);
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn AcquisitionSink>) -> Result<(), DriverError> {
        match self.get_status() {
            DriverStatus::NotInitialized => return Err(DriverError::NotInitialized),
            DriverStatus::Running => return Err(DriverError::AlreadyRunning),
            _ => {}
        }
        // Reap a thread that ended on its own (frame limit or fault).
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        let generator = PulseGenerator::new(
            self.config.geometry.clone(),
            self.config.shape.clone(),
            self.config.seed,
        )?;
        self.stop_flag.store(false, Ordering::Release);
        Self::set_status(&self.status, DriverStatus::Running);

        let config = self.config.clone();
        let stop_flag = Arc::clone(&self.stop_flag);
        let status = Arc::clone(&self.status);
        let handle = thread::Builder::new()
            .name("mock-digitizer".to_string())
            .spawn(move || Self::acquisition_loop(config, generator, sink, stop_flag, status))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| DriverError::Other("Acquisition thread panicked".to_string()))?;
        }
        debug!("MockDigitizer stopped");
        Ok(())
    }

    fn get_status(&self) -> DriverStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for MockDigitizer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("MockDigitizer dropped while acquiring; stopping it.");
            let _ = self.stop();
        }
    }
}

//! The host audio driver seam and its reference-counted lifecycle.
//!
//! Host streams are frequently `!Send`, so every opened stream is parked on
//! its own OS thread and controlled through an [`ActiveStream`] handle. The
//! real-time callbacks that run inside those streams only ever touch a
//! [`PipeWriter`] or [`PipeReader`].

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::catalog::{DeviceCatalog, DeviceDescriptor, Direction};
use super::error::{AudioError, Result};
use super::pipe::{PipeReader, PipeWriter};

/// Buffering bias of an opened stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyProfile {
    // 固定小缓冲，用于实时采集
    Low,
    // 由驱动决定（较大）的缓冲
    High,
}

impl LatencyProfile {
    pub const LOW_LATENCY_FRAMES: u32 = 512;

    pub fn buffer_frames(self) -> Option<u32> {
        match self {
            LatencyProfile::Low => Some(Self::LOW_LATENCY_FRAMES),
            LatencyProfile::High => None,
        }
    }
}

/// Format requested from the driver when a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub channels: u16,
    pub sample_rate: u32,
    /// Frames per callback; `None` lets the driver decide.
    pub buffer_frames: Option<u32>,
}

impl StreamParams {
    /// Capture at the device's native channel count and rate.
    pub fn native(device: &DeviceDescriptor, direction: Direction, latency: LatencyProfile) -> Self {
        Self {
            channels: device.channels(direction),
            sample_rate: device.default_sample_rate,
            buffer_frames: latency.buffer_frames(),
        }
    }
}

/// A host audio subsystem (PortAudio-like): global init/teardown, device
/// enumeration and callback-driven streams.
pub trait AudioDriver: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Physical initialisation. Called by [`DriverLifecycle`] only.
    fn initialize(&self) -> Result<()>;

    /// Physical teardown. Called by [`DriverLifecycle`] only.
    fn terminate(&self);

    fn catalog(&self) -> Result<DeviceCatalog>;

    /// Open and start an input stream whose callback offers a copy of every
    /// delivered buffer to `sink`.
    fn open_input(
        &self,
        device: &DeviceDescriptor,
        params: StreamParams,
        sink: PipeWriter,
    ) -> Result<ActiveStream>;

    /// Open and start an output stream whose callback drains `source`,
    /// emitting silence when it is empty.
    fn open_output(
        &self,
        device: &DeviceDescriptor,
        params: StreamParams,
        source: PipeReader,
    ) -> Result<ActiveStream>;
}

/// Reference-counted init/teardown of one shared [`AudioDriver`].
///
/// The driver is initialised on the 0 → 1 transition and torn down on the
/// 1 → 0 transition. The count never goes below zero.
pub struct DriverLifecycle {
    driver: Arc<dyn AudioDriver>,
    users: Mutex<usize>,
}

impl DriverLifecycle {
    pub fn new(driver: Arc<dyn AudioDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            users: Mutex::new(0),
        })
    }

    /// Register a user, initialising the driver if it is the first one.
    /// On init failure the count is left untouched.
    pub fn acquire(&self) -> Result<()> {
        let mut users = self.users.lock();
        // 0 → 1 时真正初始化
        if *users == 0 {
            self.driver.initialize()?;
            log::debug!("Audio driver '{}' initialized", self.driver.name());
        }
        *users += 1;
        Ok(())
    }

    /// Drop a user, tearing the driver down when the last one leaves.
    pub fn release(&self) {
        let mut users = self.users.lock();
        match *users {
            0 => log::warn!(
                "Audio driver '{}' released with no active users",
                self.driver.name()
            ),
            1 => {
                *users = 0;
                self.driver.terminate();
                log::debug!("Audio driver '{}' terminated", self.driver.name());
            }
            n => *users = n - 1,
        }
    }

    /// Acquire and wrap the registration in a guard that releases on drop.
    pub fn guard(self: &Arc<Self>) -> Result<DriverGuard> {
        self.acquire()?;
        Ok(DriverGuard {
            lifecycle: Some(self.clone()),
        })
    }

    pub fn users(&self) -> usize {
        *self.users.lock()
    }

    pub fn driver(&self) -> &Arc<dyn AudioDriver> {
        &self.driver
    }
}

/// Scoped registration with a [`DriverLifecycle`]. Releases exactly once.
pub struct DriverGuard {
    lifecycle: Option<Arc<DriverLifecycle>>,
}

impl DriverGuard {
    pub fn driver(&self) -> Option<&Arc<dyn AudioDriver>> {
        self.lifecycle.as_ref().map(|l| l.driver())
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(lifecycle) = self.lifecycle.take() {
            lifecycle.release();
        }
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Handle to a running host stream parked on its own thread.
///
/// Dropping the handle stops the stream.
pub struct ActiveStream {
    device: String,
    stop_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ActiveStream {
    /// Run `open` on a dedicated thread and keep whatever it returns alive
    /// until [`ActiveStream::stop`]. Errors from `open` are returned here.
    pub fn spawn<S, F>(thread_name: &str, device: &str, open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<S> + Send + 'static,
        S: 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let stream = match open() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // 阻塞直到收到停止或句柄被丢弃
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                device: device.to_string(),
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::stream_open(
                    device,
                    "stream thread exited before the stream started",
                ))
            }
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop and close the stream. Repeated calls are no-ops and return `Ok`.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.handle.take().map(|handle| handle.join()) {
            Some(Err(_)) => Err(AudioError::StreamClose {
                device: self.device.clone(),
                reason: "stream thread panicked".into(),
            }),
            _ => Ok(()),
        }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Default)]
    struct CountingDriver {
        inits: AtomicUsize,
        terminates: AtomicUsize,
        fail_init: AtomicBool,
    }

    impl AudioDriver for CountingDriver {
        fn name(&self) -> &str {
            "counting"
        }

        fn initialize(&self) -> Result<()> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(AudioError::driver_init("no backend"));
            }
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn terminate(&self) {
            self.terminates.fetch_add(1, Ordering::SeqCst);
        }

        fn catalog(&self) -> Result<DeviceCatalog> {
            Ok(DeviceCatalog::default())
        }

        fn open_input(
            &self,
            device: &DeviceDescriptor,
            _params: StreamParams,
            _sink: PipeWriter,
        ) -> Result<ActiveStream> {
            Err(AudioError::stream_open(&device.name, "unsupported"))
        }

        fn open_output(
            &self,
            device: &DeviceDescriptor,
            _params: StreamParams,
            _source: PipeReader,
        ) -> Result<ActiveStream> {
            Err(AudioError::stream_open(&device.name, "unsupported"))
        }
    }

    #[test]
    fn concurrent_acquire_release_inits_once() {
        let driver = Arc::new(CountingDriver::default());
        let lifecycle = DriverLifecycle::new(driver.clone());
        let n = 16;
        let barrier = Arc::new(Barrier::new(n));

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    lifecycle.acquire().unwrap();
                    barrier.wait();
                    lifecycle.release();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(driver.inits.load(Ordering::SeqCst), 1);
        assert_eq!(driver.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.users(), 0);
    }

    #[test]
    fn extra_release_clamps_at_zero() {
        let driver = Arc::new(CountingDriver::default());
        let lifecycle = DriverLifecycle::new(driver.clone());

        lifecycle.acquire().unwrap();
        lifecycle.release();
        lifecycle.release();
        lifecycle.release();

        assert_eq!(lifecycle.users(), 0);
        assert_eq!(driver.terminates.load(Ordering::SeqCst), 1);

        // Still usable afterwards.
        lifecycle.acquire().unwrap();
        assert_eq!(lifecycle.users(), 1);
        assert_eq!(driver.inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_init_leaves_count_untouched() {
        let driver = Arc::new(CountingDriver::default());
        driver.fail_init.store(true, Ordering::SeqCst);
        let lifecycle = DriverLifecycle::new(driver.clone());

        let err = lifecycle.acquire().unwrap_err();
        assert!(matches!(err, AudioError::DriverInit(_)));
        assert_eq!(lifecycle.users(), 0);

        driver.fail_init.store(false, Ordering::SeqCst);
        lifecycle.acquire().unwrap();
        assert_eq!(lifecycle.users(), 1);
    }

    #[test]
    fn guard_releases_exactly_once() {
        let driver = Arc::new(CountingDriver::default());
        let lifecycle = DriverLifecycle::new(driver.clone());

        let first = lifecycle.guard().unwrap();
        let second = lifecycle.guard().unwrap();
        assert_eq!(lifecycle.users(), 2);

        first.release();
        assert_eq!(lifecycle.users(), 1);
        drop(second);
        assert_eq!(lifecycle.users(), 0);
        assert_eq!(driver.terminates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn active_stream_stop_is_idempotent() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let mut stream = ActiveStream::spawn("test-stream", "dev", move || Ok(Flag(flag))).unwrap();
        assert!(stream.is_active());
        assert!(!closed.load(Ordering::SeqCst));

        stream.stop().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(!stream.is_active());
        stream.stop().unwrap();
    }

    #[test]
    fn active_stream_reports_unclean_close() {
        struct Exploding;
        impl Drop for Exploding {
            fn drop(&mut self) {
                panic!("backend fault while closing");
            }
        }

        let mut stream = ActiveStream::spawn("test-stream", "dev", || Ok(Exploding)).unwrap();
        let err = stream.stop().unwrap_err();
        assert!(matches!(err, AudioError::StreamClose { ref device, .. } if device == "dev"));
        stream.stop().unwrap();
    }

    #[test]
    fn active_stream_reports_open_failure() {
        let result = ActiveStream::spawn::<(), _>("test-stream", "dev", || {
            Err(AudioError::stream_open("dev", "rate not supported"))
        });
        assert!(matches!(result, Err(AudioError::StreamOpen { .. })));
    }
}

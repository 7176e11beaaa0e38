//! Capture recorders: open an input stream on a selected device and expose
//! its callbacks as a stream of [`SampleBatch`]es.
//!
//! [`SampleBatch`]: super::pipe::SampleBatch

use std::sync::Arc;

use parking_lot::Mutex;

use super::catalog::{DeviceDescriptor, Direction, SelectionPolicy};
use super::driver::{ActiveStream, DriverGuard, DriverLifecycle, LatencyProfile, StreamParams};
use super::error::{AudioError, Result};
use super::pipe::{CAPTURE_PIPE_CAPACITY, PipeReader, PipeStats, PipeWriter, sample_pipe};

/// What the recorder listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderKind {
    /// A microphone or line input, low-latency buffers.
    Capture,
    /// System output through a virtual loopback device, larger buffers.
    OutputCapture,
}

impl RecorderKind {
    pub fn policy(self) -> SelectionPolicy {
        match self {
            RecorderKind::Capture => SelectionPolicy::Direct,
            RecorderKind::OutputCapture => SelectionPolicy::Loopback,
        }
    }

    pub fn latency(self) -> LatencyProfile {
        match self {
            RecorderKind::Capture => LatencyProfile::Low,
            RecorderKind::OutputCapture => LatencyProfile::High,
        }
    }
}

/// Device and format a recorder ended up with.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub device: DeviceDescriptor,
    pub params: StreamParams,
}

struct RecorderState {
    guard: Option<DriverGuard>,
    writer: Option<PipeWriter>,
    stream: Option<ActiveStream>,
    recording: Option<Recording>,
    closed: bool,
}

pub struct Recorder {
    kind: RecorderKind,
    lifecycle: Arc<DriverLifecycle>,
    state: Mutex<RecorderState>,
    samples: Mutex<Option<PipeReader>>,
    stats: PipeStats,
}

impl Recorder {
    /// Register with the driver and prepare a sample pipe of the default
    /// capacity. The stream itself is opened by [`Recorder::start`].
    pub fn new(kind: RecorderKind, lifecycle: Arc<DriverLifecycle>) -> Result<Self> {
        Self::with_capacity(kind, lifecycle, CAPTURE_PIPE_CAPACITY)
    }

    pub fn with_capacity(
        kind: RecorderKind,
        lifecycle: Arc<DriverLifecycle>,
        capacity: usize,
    ) -> Result<Self> {
        let guard = lifecycle.guard()?;
        let (writer, reader) = sample_pipe(capacity);
        let stats = writer.stats();

        Ok(Self {
            kind,
            lifecycle,
            state: Mutex::new(RecorderState {
                guard: Some(guard),
                writer: Some(writer),
                stream: None,
                recording: None,
                closed: false,
            }),
            samples: Mutex::new(Some(reader)),
            stats,
        })
    }

    pub fn kind(&self) -> RecorderKind {
        self.kind
    }

    /// Select a device for `label` and start capturing from it.
    pub fn start(&self, label: &str) -> Result<Recording> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AudioError::RecorderClosed);
        }
        if state.stream.is_some() {
            return Err(AudioError::AlreadyRunning);
        }
        let writer = state.writer.clone().ok_or(AudioError::RecorderClosed)?;

        // 枚举并选择设备，按设备原生格式打开
        let driver = self.lifecycle.driver();
        let catalog = driver.catalog()?;
        let device = catalog.select(label, self.kind.policy(), Direction::Input)?;
        let params = StreamParams::native(&device, Direction::Input, self.kind.latency());

        let stream = driver.open_input(&device, params, writer)?;

        log::info!(
            "Recorder started on '{}' ({} Hz, {} ch, {:?})",
            device.name,
            params.sample_rate,
            params.channels,
            self.kind
        );

        let recording = Recording { device, params };
        state.stream = Some(stream);
        state.recording = Some(recording.clone());
        Ok(recording)
    }

    /// Stop capturing, close the sample stream and release the driver.
    /// Only the first call does anything. The recorder is closed and the
    /// driver released even when the stream reports an unclean shutdown.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let stopped = match state.stream.take() {
            Some(mut stream) => stream.stop(),
            None => Ok(()),
        };
        // 丢弃写端后读端会收到结束
        state.writer = None;
        if let Some(guard) = state.guard.take() {
            guard.release();
        }

        let dropped = self.stats.dropped();
        if dropped > 0 {
            log::warn!("Recorder stopped, {} batches dropped on a full pipe", dropped);
        } else {
            log::info!("Recorder stopped");
        }
        stopped
    }

    /// Hand out the consumer side of the sample pipe. Returns `None` after
    /// the first call.
    pub fn take_samples(&self) -> Option<PipeReader> {
        self.samples.lock().take()
    }

    pub fn recording(&self) -> Option<Recording> {
        self.state.lock().recording.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn dropped_batches(&self) -> u64 {
        self.stats.dropped()
    }

    pub fn pipe_stats(&self) -> PipeStats {
        self.stats.clone()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{}", e);
        }
    }
}

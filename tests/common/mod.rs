#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use voxlink_rs::audio::{
    ActiveStream, AudioDriver, AudioError, DeviceCatalog, DeviceDescriptor, HostApi, PipeReader,
    PipeWriter, PlaybackSink, Result, StreamParams,
};

/// Scriptable in-memory audio driver.
pub struct FakeDriver {
    pub inits: AtomicUsize,
    pub terminates: AtomicUsize,
    pub fail_open: AtomicBool,
    /// Capture streams fault while being closed.
    pub fail_close: AtomicBool,
    /// Value written to every captured sample.
    pub level: Mutex<f32>,
    pub opened: Mutex<Vec<(String, StreamParams)>>,
    pub played: Arc<Mutex<Vec<Vec<f32>>>>,
    catalog: DeviceCatalog,
}

fn device(index: usize, name: &str, inputs: u16, outputs: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        host_api: "Fake".into(),
        name: name.into(),
        index,
        max_input_channels: inputs,
        max_output_channels: outputs,
        default_sample_rate: 24000,
    }
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        let catalog = DeviceCatalog::new(
            vec![HostApi {
                name: "Fake".into(),
                devices: vec![
                    device(0, "Built-in Microphone", 1, 0),
                    device(1, "USB Mic", 2, 0),
                    device(2, "USB Mic Pro", 2, 0),
                    device(3, "BlackHole 2ch", 2, 2),
                    device(4, "Speakers", 0, 2),
                ],
                default_input: Some("Built-in Microphone".into()),
                default_output: Some("Speakers".into()),
            }],
            Some("Fake".into()),
        );
        Arc::new(Self {
            inits: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            level: Mutex::new(0.25),
            opened: Mutex::new(Vec::new()),
            played: Arc::new(Mutex::new(Vec::new())),
            catalog,
        })
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn opened_devices(&self) -> Vec<String> {
        self.opened.lock().iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Background thread standing in for a driver callback.
struct Worker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    fault_on_close: bool,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if self.fault_on_close {
            panic!("fake backend fault while closing");
        }
    }
}

impl AudioDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn initialize(&self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self) {
        self.terminates.fetch_add(1, Ordering::SeqCst);
    }

    fn catalog(&self) -> Result<DeviceCatalog> {
        Ok(self.catalog.clone())
    }

    fn open_input(
        &self,
        device: &DeviceDescriptor,
        params: StreamParams,
        sink: PipeWriter,
    ) -> Result<ActiveStream> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(AudioError::stream_open(&device.name, "rejected by fake driver"));
        }
        self.opened.lock().push((device.name.clone(), params));

        let level = *self.level.lock();
        let fault_on_close = self.fail_close.load(Ordering::SeqCst);
        let batch_len = 240 * params.channels as usize;
        ActiveStream::spawn("fake-capture", &device.name, move || {
            let running = Arc::new(AtomicBool::new(true));
            let flag = running.clone();
            let handle = thread::spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    sink.offer(vec![level; batch_len]);
                    thread::sleep(Duration::from_millis(5));
                }
            });
            Ok(Worker {
                running,
                handle: Some(handle),
                fault_on_close,
            })
        })
    }

    fn open_output(
        &self,
        device: &DeviceDescriptor,
        params: StreamParams,
        mut source: PipeReader,
    ) -> Result<ActiveStream> {
        self.opened.lock().push((device.name.clone(), params));
        let played = self.played.clone();
        ActiveStream::spawn("fake-output", &device.name, move || {
            let running = Arc::new(AtomicBool::new(true));
            let flag = running.clone();
            let handle = thread::spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    while let Some(batch) = source.try_recv() {
                        played.lock().push(batch);
                    }
                    thread::sleep(Duration::from_millis(2));
                }
            });
            Ok(Worker {
                running,
                handle: Some(handle),
                fault_on_close: false,
            })
        })
    }
}

/// Sink that records every frame it is given.
#[derive(Clone, Default)]
pub struct CollectingSink {
    pub frames: Arc<Mutex<Vec<Vec<i16>>>>,
    pub finished: Arc<AtomicBool>,
}

impl CollectingSink {
    pub fn samples(&self) -> usize {
        self.frames.lock().iter().map(Vec::len).sum()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for CollectingSink {
    fn name(&self) -> &str {
        "collect"
    }

    fn push_frame(&mut self, frame: &[i16]) {
        self.frames.lock().push(frame.to_vec());
    }

    fn finish(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// Little-endian PCM16 packet of `n` copies of `value`.
pub fn pcm_packet(value: i16, n: usize) -> Vec<u8> {
    std::iter::repeat(value)
        .take(n)
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// Data size recorded in a WAV header.
pub fn wav_data_size(path: &Path) -> u32 {
    let bytes = std::fs::read(path).unwrap();
    read_u32(&bytes, 40)
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

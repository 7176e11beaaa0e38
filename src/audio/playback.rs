//! Playback sinks fed by the downlink with decoded PCM frames.
//!
//! - [`SpeakerSink`]: frames → [`StreamBuffer`] → `audio-play` thread → ALSA
//! - [`RedirectSink`]: frames → sample pipe → host output callback on a
//!   loopback device

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};

use super::alsa_device;
use super::catalog::{DeviceDescriptor, Direction, SelectionPolicy};
use super::driver::{ActiveStream, DriverGuard, DriverLifecycle, StreamParams};
use super::error::Result as AudioResult;
use super::pcm;
use super::pipe::{PipeStats, PipeWriter, sample_pipe};

/// Receives decoded frames in arrival order.
pub trait PlaybackSink: Send {
    fn name(&self) -> &str;

    /// Hand over one decoded frame. Must not block for long.
    fn push_frame(&mut self, frame: &[i16]);

    /// Called once after the last frame.
    fn finish(&mut self) {}
}

#[derive(Default)]
struct BufferState {
    bytes: VecDeque<u8>,
    closed: bool,
    aborted: bool,
}

/// Growable byte FIFO: writers append, a single reader blocks until data
/// arrives or the buffer is closed.
#[derive(Default)]
pub struct StreamBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, data: &[u8]) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.bytes.extend(data);
        self.ready.notify_one();
    }

    /// Copy up to `out.len()` bytes. Blocks while empty; returns 0 only once
    /// the buffer is closed and drained.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        while state.bytes.is_empty() && !state.closed {
            self.ready.wait(&mut state);
        }
        let n = out.len().min(state.bytes.len());
        for (dst, src) in out.iter_mut().zip(state.bytes.drain(..n)) {
            *dst = src;
        }
        n
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    /// Close and discard everything still queued.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.aborted = true;
        state.bytes.clear();
        self.ready.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn len(&self) -> usize {
        self.state.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plays decoded audio on an ALSA device from a dedicated thread.
pub struct SpeakerSink {
    buffer: Arc<StreamBuffer>,
    handle: Option<JoinHandle<()>>,
}

impl SpeakerSink {
    pub fn open(device: &str, sample_rate: u32, channels: u16) -> Result<Self> {
        let device = device.to_string();
        Self::with_player(move |reader| {
            if let Err(e) = play_thread(&device, sample_rate, channels, reader) {
                log::error!("Playback thread error: {}", e);
            }
        })
    }

    /// Run `player` on the `audio-play` thread against the sink's buffer.
    fn with_player<F>(player: F) -> Result<Self>
    where
        F: FnOnce(&StreamBuffer) + Send + 'static,
    {
        let buffer = Arc::new(StreamBuffer::new());
        let reader = buffer.clone();

        let handle = thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || {
                player(&reader);
                // 设备退出后丢弃后续写入
                reader.close();
            })?;

        Ok(Self {
            buffer,
            handle: Some(handle),
        })
    }

    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }
}

impl PlaybackSink for SpeakerSink {
    fn name(&self) -> &str {
        "speaker"
    }

    fn push_frame(&mut self, frame: &[i16]) {
        self.buffer.write(&pcm::pcm16_to_le_bytes(frame));
    }

    /// Stops at once: queued audio is discarded, not played out.
    fn finish(&mut self) {
        self.buffer.abort();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.finish();
    }
}

fn play_thread(device: &str, sample_rate: u32, channels: u16, buffer: &StreamBuffer) -> Result<()> {
    let (alsa_pcm, params) = alsa_device::open_playback(device, sample_rate, channels as u32, None)?;
    let io = alsa_pcm.io_i16()?;
    let out_channels = params.channels as u16;

    let frame_bytes = channels as usize * 2;
    let mut chunk = vec![0u8; params.period_size.max(1) * frame_bytes];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = buffer.read(&mut chunk);
        if n == 0 {
            break;
        }
        carry.extend_from_slice(&chunk[..n]);
        let whole = carry.len() - carry.len() % frame_bytes;
        if whole == 0 {
            continue;
        }
        let samples = pcm::pcm16_from_le_bytes(&carry[..whole]);
        carry.drain(..whole);

        let pcm_data = pcm::convert_channels(&samples, channels, out_channels);
        let total_frames = pcm_data.len() / out_channels as usize;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames && !buffer.is_aborted() {
            let offset = frames_written * out_channels as usize;
            match io.writei(&pcm_data[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    if let Err(e2) = alsa_pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }

                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    // 中止时丢弃设备缓冲，否则播放完剩余数据
    if buffer.is_aborted() {
        let _ = alsa_pcm.drop();
    } else {
        let _ = alsa_pcm.drain();
    }
    log::info!("Playback stopped");
    Ok(())
}

/// Sends decoded audio to a virtual loopback output so other applications
/// can pick it up as an input.
pub struct RedirectSink {
    device: DeviceDescriptor,
    writer: Option<PipeWriter>,
    stats: PipeStats,
    stream: Option<ActiveStream>,
    guard: Option<DriverGuard>,
}

impl RedirectSink {
    pub fn open(
        lifecycle: &Arc<DriverLifecycle>,
        label: &str,
        sample_rate: u32,
        channels: u16,
        frame_size: usize,
        capacity: usize,
    ) -> AudioResult<Self> {
        let guard = lifecycle.guard()?;
        let driver = lifecycle.driver();
        let device = driver
            .catalog()?
            .select(label, SelectionPolicy::Loopback, Direction::Output)?;

        let params = StreamParams {
            channels,
            sample_rate,
            buffer_frames: u32::try_from(frame_size).ok(),
        };
        let (writer, reader) = sample_pipe(capacity);
        let stats = writer.stats();
        let stream = driver.open_output(&device, params, reader)?;

        log::info!(
            "Playback redirected to '{}' ({} ch max)",
            device.name,
            device.max_output_channels
        );

        Ok(Self {
            device,
            writer: Some(writer),
            stats,
            stream: Some(stream),
            guard: Some(guard),
        })
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn dropped_frames(&self) -> u64 {
        self.stats.dropped()
    }
}

impl PlaybackSink for RedirectSink {
    fn name(&self) -> &str {
        "redirect"
    }

    fn push_frame(&mut self, frame: &[i16]) {
        if let Some(writer) = &self.writer {
            writer.offer(pcm::pcm16_to_f32(frame));
        }
    }

    fn finish(&mut self) {
        self.writer = None;
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.stop() {
                log::warn!("{}", e);
            }
        }
        if let Some(guard) = self.guard.take() {
            guard.release();
            let dropped = self.stats.dropped();
            if dropped > 0 {
                log::warn!("Redirect output dropped {} frames", dropped);
            }
        }
    }
}

impl Drop for RedirectSink {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reader_blocks_until_write() {
        let buffer = Arc::new(StreamBuffer::new());
        let reader = buffer.clone();
        let handle = thread::spawn(move || {
            let mut out = [0u8; 8];
            let n = reader.read(&mut out);
            out[..n].to_vec()
        });

        thread::sleep(Duration::from_millis(20));
        buffer.write(&[1, 2, 3]);
        assert_eq!(handle.join().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn close_drains_then_reports_end() {
        let buffer = StreamBuffer::new();
        buffer.write(&[9; 5]);
        buffer.close();
        buffer.write(&[1]);

        let mut out = [0u8; 3];
        assert_eq!(buffer.read(&mut out), 3);
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(buffer.read(&mut out), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn abort_discards_queued_bytes() {
        let buffer = StreamBuffer::new();
        buffer.write(&[7; 64]);
        buffer.abort();
        buffer.write(&[1]);
        assert!(buffer.is_aborted());
        assert!(buffer.is_empty());
        assert_eq!(buffer.read(&mut [0u8; 8]), 0);
    }

    #[test]
    fn finish_returns_while_audio_is_queued() {
        let played = Arc::new(Mutex::new(0usize));
        let counter = played.clone();
        // 4 bytes per 10 ms stands in for a device far slower than the queue.
        let mut sink = SpeakerSink::with_player(move |reader| {
            let mut out = [0u8; 4];
            loop {
                let n = reader.read(&mut out);
                if n == 0 {
                    break;
                }
                *counter.lock() += n;
                thread::sleep(Duration::from_millis(10));
            }
        })
        .unwrap();

        // 10 s of 24 kHz mono.
        sink.push_frame(&vec![1000i16; 240_000]);
        thread::sleep(Duration::from_millis(30));
        assert!(!sink.buffer().is_empty());

        let started = std::time::Instant::now();
        sink.finish();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(sink.buffer().is_empty());
        assert!(*played.lock() < 480_000);

        sink.finish();
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let buffer = Arc::new(StreamBuffer::new());
        let reader = buffer.clone();
        let handle = thread::spawn(move || reader.read(&mut [0u8; 4]));
        thread::sleep(Duration::from_millis(20));
        buffer.close();
        assert_eq!(handle.join().unwrap(), 0);
    }
}

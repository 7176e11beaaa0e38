//! Receive path: transport packets → decode → playback sink + WAV archive.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::signal::StopListener;
use super::stats::SessionStats;
use crate::audio::pcm;
use crate::audio::{PlaybackSink, StreamDecoder, WavWriter};
use crate::transport::Transport;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct Archive {
    pub path: PathBuf,
    pub writer: WavWriter<BufWriter<File>>,
}

pub(crate) struct Downlink {
    pub transport: Arc<dyn Transport>,
    pub decoder: Box<dyn StreamDecoder>,
    pub sink: Option<Box<dyn PlaybackSink>>,
    pub archive: Option<Archive>,
    pub stop: StopListener,
    pub stats: Arc<SessionStats>,
}

impl Downlink {
    pub async fn run(self) {
        let Downlink {
            transport,
            mut decoder,
            mut sink,
            mut archive,
            mut stop,
            stats,
        } = self;

        let samples_per_sec = (decoder.sample_rate() as f64 * decoder.channels() as f64).max(1.0);
        let mut last_report = Instant::now();
        let mut interval_packets = 0u64;
        let mut interval_samples = 0u64;

        loop {
            let received = tokio::select! {
                biased;
                _ = stop.wait() => break,
                received = transport.recv() => received,
            };

            let packet = match received {
                Ok(packet) => packet,
                Err(e) if e.is_terminal() => {
                    log::info!("Transport closed, downlink exiting");
                    break;
                }
                Err(e) => {
                    SessionStats::bump(&stats.transient_errors);
                    log::debug!("Transient receive error: {}", e);
                    continue;
                }
            };

            let packets = SessionStats::bump(&stats.packets_received);
            if packets == 1 {
                log::info!("First audio packet received ({} bytes)", packet.len());
            }
            interval_packets += 1;

            // 解码失败只计数，不中断接收
            let frame = match decoder.decode(&packet) {
                Ok(frame) => frame,
                Err(e) => {
                    let errors = SessionStats::bump(&stats.decode_errors);
                    if errors == 1 || errors % 50 == 0 {
                        log::warn!("Audio decode error ({} so far): {}", errors, e);
                    }
                    continue;
                }
            };
            if frame.is_empty() {
                continue;
            }
            SessionStats::bump(&stats.frames_decoded);
            interval_samples += frame.len() as u64;

            // 仅用于诊断，静音帧照常播放和存档
            if pcm::has_sound(&frame) {
                stats.output_sound.store(true, Ordering::Relaxed);
            }

            if let Some(sink) = sink.as_mut() {
                sink.push_frame(&frame);
            }

            if let Some(archive) = archive.as_mut() {
                let before = archive.writer.bytes_written();
                match archive.writer.write_samples(&frame) {
                    Ok(()) => SessionStats::add(
                        &stats.archived_bytes,
                        archive.writer.bytes_written() - before,
                    ),
                    Err(e) => {
                        let errors = SessionStats::bump(&stats.archive_errors);
                        if errors == 1 {
                            log::warn!("Failed to write audio archive: {}", e);
                        }
                    }
                }
            }

            if last_report.elapsed() >= REPORT_INTERVAL {
                log::info!(
                    "Downlink: {} packets (~{:.2}s of audio) in the last interval",
                    interval_packets,
                    interval_samples as f64 / samples_per_sec
                );
                last_report = Instant::now();
                interval_packets = 0;
                interval_samples = 0;
            }
        }

        // 退出时补写 WAV 头
        if let Some(mut archive) = archive.take() {
            match archive.writer.finalize() {
                Ok(()) => log::info!(
                    "Saved {:.2} seconds of audio to {} (non-silent audio: {})",
                    archive.writer.duration_secs(),
                    archive.path.display(),
                    stats.output_sound.load(Ordering::Relaxed)
                ),
                Err(e) => log::error!(
                    "Failed to finalize audio archive {}: {}",
                    archive.path.display(),
                    e
                ),
            }
        }

        // finish() 会等待播放线程退出，放到阻塞线程池执行
        if let Some(mut sink) = sink.take() {
            let name = sink.name().to_string();
            match tokio::task::spawn_blocking(move || sink.finish()).await {
                Ok(()) => log::debug!("Playback sink '{}' finished", name),
                Err(e) => log::error!("Playback sink '{}' failed to finish: {}", name, e),
            }
        }
    }
}

//! Send path: capture pipe → PCM16 → base64 → `input_audio_buffer.append`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tokio::sync::watch;

use super::signal::StopListener;
use super::stats::SessionStats;
use crate::audio::pcm;
use crate::audio::{PipeReader, PipeStats};
use crate::protocol::ClientEvent;
use crate::transport::Transport;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct Uplink {
    pub transport: Arc<dyn Transport>,
    pub samples: PipeReader,
    pub channels: u16,
    pub sample_rate: u32,
    /// Raised once the session configuration has landed.
    pub configured: watch::Receiver<bool>,
    pub stop: StopListener,
    pub stats: Arc<SessionStats>,
    pub pipe: PipeStats,
}

impl Uplink {
    pub async fn run(self) {
        let Uplink {
            transport,
            mut samples,
            channels,
            sample_rate,
            configured,
            mut stop,
            stats,
            pipe,
        } = self;

        let mut last_report = Instant::now();
        let mut interval_peak = 0.0f32;
        let mut interval_samples = 0u64;

        loop {
            let batch = tokio::select! {
                biased;
                _ = stop.wait() => break,
                batch = samples.recv() => match batch {
                    Some(batch) => batch,
                    None => {
                        log::info!("Capture stream closed");
                        break;
                    }
                },
            };

            // 下混为单声道并记录峰值
            let mono = pcm::downmix_to_mono(&batch, channels);
            let peak = pcm::peak_level(&mono);
            interval_peak = interval_peak.max(peak);
            if peak > 0.0 {
                stats.input_sound.store(true, Ordering::Relaxed);
            }

            // 配置完成前的音频直接丢弃，不排队
            let ready = *configured.borrow();
            if !ready || !transport.is_open() {
                SessionStats::bump(&stats.batches_gated);
                continue;
            }

            // PCM16 → base64 → input_audio_buffer.append
            let bytes = pcm::f32_to_pcm16_le(&mono);
            let text = match ClientEvent::audio_append(STANDARD.encode(&bytes)).encode() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode audio event: {}", e);
                    continue;
                }
            };

            match transport.send_text(text).await {
                Ok(()) => {
                    SessionStats::bump(&stats.batches_sent);
                    SessionStats::add(&stats.samples_sent, mono.len() as u64);
                    SessionStats::add(&stats.bytes_sent, bytes.len() as u64);
                    interval_samples += mono.len() as u64;
                }
                Err(e) => {
                    let failures = SessionStats::bump(&stats.send_failures);
                    if failures == 1 || failures % 100 == 0 {
                        log::warn!("Audio send failed ({} so far): {}", failures, e);
                    }
                }
            }

            if last_report.elapsed() >= REPORT_INTERVAL {
                let total = stats.samples_sent.load(Ordering::Relaxed);
                log::info!(
                    "Uplink: {:.1}s sent ({} samples this interval, {:.1} KiB total), peak {:.3}, {} dropped",
                    total as f64 / sample_rate.max(1) as f64,
                    interval_samples,
                    stats.bytes_sent.load(Ordering::Relaxed) as f64 / 1024.0,
                    interval_peak,
                    pipe.dropped()
                );
                last_report = Instant::now();
                interval_peak = 0.0;
                interval_samples = 0;
            }
        }

        if !stats.input_sound.load(Ordering::Relaxed) {
            log::warn!("No non-silent input was captured; check the input device");
        }
        log::info!(
            "Uplink stopped after {} batches",
            stats.batches_sent.load(Ordering::Relaxed)
        );
    }
}

//! Duplex session orchestration.
//!
//! A session owns one recorder and one transport and runs three tasks
//! against a single [`StopSignal`]:
//!
//! - configure: waits for the link, sends `session.update`, opens the gate
//! - uplink: capture pipe → transport (gated on configuration)
//! - downlink: transport → decoder → playback sink + WAV archive
//!
//! State progresses `Idle → Connected → Streaming → Stopping → Stopped` and
//! never moves backwards.

mod downlink;
mod signal;
mod stats;
mod uplink;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::wav_writer::WavSpec;
use crate::audio::{PlaybackSink, Recorder, Recording, StreamDecoder, WavWriter};
use crate::protocol::ClientEvent;
use crate::transport::{LinkState, Transport, TransportError, wait_for_state};

use downlink::{Archive, Downlink};
use uplink::Uplink;

pub use signal::{StopListener, StopSignal};
pub use stats::{SessionStats, StatsSnapshot};

pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_TARGET_LANG: &str = "English";

// 存档名中会话 id 的前缀长度
const ARCHIVE_TAG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    Connected,
    Streaming,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target_lang: String,
    pub voice: String,
    /// Replaces the generated interpreter prompt when non-empty.
    pub system_prompt: String,
    /// Pause between sending `session.update` and releasing audio.
    pub settle_delay: Duration,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
    pub audio_dir: PathBuf,
    pub record_to_file: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_lang: DEFAULT_TARGET_LANG.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_prompt: String::new(),
            settle_delay: Duration::from_millis(100),
            ready_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_millis(100),
            audio_dir: default_audio_dir(),
            record_to_file: true,
        }
    }
}

pub fn default_audio_dir() -> PathBuf {
    std::env::temp_dir().join("voxlink")
}

/// Interpreter instructions for `target_lang`.
pub fn translation_prompt(target_lang: &str) -> String {
    format!(
        "You are a real-time simultaneous interpreter. Translate everything the user says into {lang}, \
         keeping the speaker's rhythm, tone and emotion. The result must sound natural to a native \
         {lang} listener. Output only the translation, with no explanations or prefixes, and always \
         respond with speech.",
        lang = target_lang
    )
}

#[derive(Debug, Clone)]
struct Settings {
    target_lang: String,
    voice: String,
    system_prompt: String,
}

impl Settings {
    fn instructions(&self) -> String {
        if self.system_prompt.is_empty() {
            translation_prompt(&self.target_lang)
        } else {
            self.system_prompt.clone()
        }
    }
}

fn or_default(value: &str, default: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Move forward to `next` unless the session is already past it.
fn advance(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if *current < next {
            *current = next;
            true
        } else {
            false
        }
    })
}

pub struct Session {
    id: String,
    transport: Arc<dyn Transport>,
    recorder: Recorder,
    config: SessionConfig,
    settings: RwLock<Settings>,
    state: Arc<watch::Sender<SessionState>>,
    configured: Arc<watch::Sender<bool>>,
    stop: StopSignal,
    stats: Arc<SessionStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    playback_attached: AtomicBool,
    stopped: AtomicBool,
    archive_path: Mutex<Option<PathBuf>>,
}

impl Session {
    /// Create an idle session. Fails if the archive directory cannot be
    /// created.
    pub fn new(transport: Arc<dyn Transport>, recorder: Recorder, config: SessionConfig) -> Result<Self> {
        if config.record_to_file {
            std::fs::create_dir_all(&config.audio_dir).with_context(|| {
                format!("failed to create audio directory {}", config.audio_dir.display())
            })?;
        }

        let settings = Settings {
            target_lang: or_default(&config.target_lang, DEFAULT_TARGET_LANG),
            voice: or_default(&config.voice, DEFAULT_VOICE),
            system_prompt: config.system_prompt.clone(),
        };
        let (state, _) = watch::channel(SessionState::Idle);
        let (configured, _) = watch::channel(false);
        let id = Uuid::new_v4().to_string();

        log::info!(
            "Session {} created (target: {}, voice: {})",
            id,
            settings.target_lang,
            settings.voice
        );

        Ok(Self {
            id,
            transport,
            recorder,
            config,
            settings: RwLock::new(settings),
            state: Arc::new(state),
            configured: Arc::new(configured),
            stop: StopSignal::new(),
            stats: Arc::new(SessionStats::default()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            playback_attached: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            archive_path: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the transport to open, up to the configured deadline.
    /// Returns `false` on timeout or stop; callers may proceed regardless.
    pub async fn wait_until_ready(&self) -> bool {
        let mut link = self.transport.state();
        let mut stop = self.stop.listener();

        let opened = tokio::select! {
            biased;
            _ = stop.wait() => false,
            result = tokio::time::timeout(
                self.config.ready_timeout,
                wait_for_state(&mut link, LinkState::Open),
            ) => matches!(result, Ok(true)),
        };

        if opened {
            advance(&self.state, SessionState::Connected);
        } else if !self.stop.is_triggered() {
            log::warn!(
                "Transport not ready after {:?}, continuing; audio stays gated until configuration lands",
                self.config.ready_timeout
            );
        }
        opened
    }

    /// Start the receive path. `sink` may be `None` to archive only.
    pub fn attach_playback(
        &self,
        decoder: Box<dyn StreamDecoder>,
        sink: Option<Box<dyn PlaybackSink>>,
    ) -> Result<()> {
        if self.stop.is_triggered() {
            bail!("session {} is stopped", self.id);
        }
        if self.playback_attached.swap(true, Ordering::SeqCst) {
            bail!("playback already attached to session {}", self.id);
        }

        let archive = if self.config.record_to_file {
            self.create_archive(decoder.sample_rate(), decoder.channels())
        } else {
            None
        };

        let downlink = Downlink {
            transport: self.transport.clone(),
            decoder,
            sink,
            archive,
            stop: self.stop.listener(),
            stats: self.stats.clone(),
        };
        self.tasks.lock().push(tokio::spawn(downlink.run()));
        Ok(())
    }

    /// Start capturing from `label` and streaming it once the session is
    /// configured.
    pub fn start(&self, label: &str) -> Result<Recording> {
        if self.stop.is_triggered() {
            bail!("session {} is stopped", self.id);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("session {} already started", self.id);
        }

        let recording = match self.recorder.start(label) {
            Ok(recording) => recording,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e).with_context(|| format!("failed to start capture on '{}'", label));
            }
        };
        let samples = self
            .recorder
            .take_samples()
            .context("capture sample stream already taken")?;

        let configure = configure_task(
            self.transport.clone(),
            self.settings.read().clone(),
            self.config.settle_delay,
            self.state.clone(),
            self.configured.clone(),
            self.stop.clone(),
        );

        let uplink = Uplink {
            transport: self.transport.clone(),
            samples,
            channels: recording.params.channels,
            sample_rate: recording.params.sample_rate,
            configured: self.configured.subscribe(),
            stop: self.stop.listener(),
            stats: self.stats.clone(),
            pipe: self.recorder.pipe_stats(),
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(configure));
        tasks.push(tokio::spawn(uplink.run()));
        Ok(recording)
    }

    /// Stop every task, cancel the response, close the link and release
    /// the recorder. Only the first call does any work.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // 1. 广播停止信号
        advance(&self.state, SessionState::Stopping);
        self.stop.trigger();
        log::info!("Stopping session {}", self.id);

        // 2. 尽力取消进行中的响应，然后关闭链路和录音
        if self.transport.is_open() {
            match ClientEvent::ResponseCancel.encode() {
                Ok(text) => {
                    if let Err(e) = self.transport.send_text(text).await {
                        log::debug!("response.cancel not delivered: {}", e);
                    }
                }
                Err(e) => log::error!("Failed to encode response.cancel: {}", e),
            }
        }
        self.transport.close().await;
        if let Err(e) = self.recorder.stop() {
            log::warn!("Capture did not stop cleanly: {}", e);
        }

        // 3. 留出收尾时间后等待所有任务退出
        tokio::time::sleep(self.config.shutdown_grace).await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Session task failed: {}", e);
            }
        }

        advance(&self.state, SessionState::Stopped);
        let stats = self.stats();
        log::info!(
            "Session {} stopped: {} batches sent, {} packets received, {} decode errors, {} dropped",
            self.id,
            stats.batches_sent,
            stats.packets_received,
            stats.decode_errors,
            stats.batches_dropped
        );
    }

    /// Resolve when the transport closes or the session is stopped.
    pub async fn wait_closed(&self) {
        let mut link = self.transport.state();
        let mut stop = self.stop.listener();
        tokio::select! {
            _ = wait_for_state(&mut link, LinkState::Closed) => {}
            _ = stop.wait() => {}
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_configured(&self) -> bool {
        *self.configured.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.recorder.dropped_batches())
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn archive_path(&self) -> Option<PathBuf> {
        self.archive_path.lock().clone()
    }

    pub fn set_target_language(&self, lang: &str) {
        self.settings.write().target_lang = or_default(lang, DEFAULT_TARGET_LANG);
    }

    pub fn set_voice(&self, voice: &str) {
        self.settings.write().voice = or_default(voice, DEFAULT_VOICE);
    }

    /// An empty prompt restores the generated one.
    pub fn set_system_prompt(&self, prompt: &str) {
        self.settings.write().system_prompt = prompt.to_string();
    }

    pub fn instructions(&self) -> String {
        self.settings.read().instructions()
    }

    pub fn voice(&self) -> String {
        self.settings.read().voice.clone()
    }

    /// Push the current voice to the endpoint.
    pub async fn update_voice(&self) -> Result<(), TransportError> {
        let voice = self.voice();
        self.send_event(ClientEvent::voice_update(voice)).await
    }

    /// Push the current instructions to the endpoint.
    pub async fn update_instructions(&self) -> Result<(), TransportError> {
        let instructions = self.instructions();
        self.send_event(ClientEvent::instructions_update(instructions)).await
    }

    async fn send_event(&self, event: ClientEvent) -> Result<(), TransportError> {
        if !self.transport.is_open() {
            return Err(TransportError::NotOpen);
        }
        let text = event
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.transport.send_text(text).await
    }

    fn create_archive(&self, sample_rate: u32, channels: u16) -> Option<Archive> {
        let path = archive_path(&self.config.audio_dir, &self.id);
        match WavWriter::create(&path, WavSpec::pcm16(sample_rate, channels)) {
            Ok(writer) => {
                log::info!("Saving received audio to {}", path.display());
                *self.archive_path.lock() = Some(path.clone());
                Some(Archive { path, writer })
            }
            Err(e) => {
                log::warn!(
                    "Failed to create audio archive {}: {}; continuing without it",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

/// `realtime-audio-YYYYMMDD-HHMMSS-<id prefix>.wav`
fn archive_path(dir: &Path, session_id: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let tag: String = session_id.chars().take(ARCHIVE_TAG_LEN).collect();
    dir.join(format!("realtime-audio-{}-{}.wav", stamp, tag))
}

/// Wait for the link, send the session configuration, then open the gate.
async fn configure_task(
    transport: Arc<dyn Transport>,
    settings: Settings,
    settle_delay: Duration,
    state: Arc<watch::Sender<SessionState>>,
    configured: Arc<watch::Sender<bool>>,
    stop: StopSignal,
) {
    let mut link = transport.state();
    let mut stop = stop.listener();

    let open = tokio::select! {
        biased;
        _ = stop.wait() => return,
        open = wait_for_state(&mut link, LinkState::Open) => open,
    };
    if !open {
        return;
    }
    advance(&state, SessionState::Connected);

    // 发送会话配置，失败则保持门控关闭
    let event = ClientEvent::session_update(settings.voice.clone(), settings.instructions());
    let sent = match event.encode() {
        Ok(text) => transport.send_text(text).await,
        Err(e) => Err(TransportError::Protocol(e.to_string())),
    };
    if let Err(e) = sent {
        log::error!("Failed to send session configuration: {}; audio stays gated", e);
        return;
    }
    log::info!(
        "Session configured (voice: {}, target: {})",
        settings.voice,
        settings.target_lang
    );

    // 等待服务端应用配置
    tokio::select! {
        biased;
        _ = stop.wait() => return,
        _ = tokio::time::sleep(settle_delay) => {}
    }

    configured.send_replace(true);
    if advance(&state, SessionState::Streaming) {
        log::info!("Streaming audio");
    }
}

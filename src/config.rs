use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::audio::RecorderKind;
use crate::net_link::LinkConfig;
use crate::session::{SessionConfig, default_audio_dir};

/// Where decoded downlink audio is played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    /// ALSA device on a dedicated thread
    Speaker,
    /// Virtual loopback output through the host driver
    Redirect,
    /// Archive only
    None,
}

#[derive(Debug, Serialize, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: String,
    #[serde(skip_serializing)]
    pub ws_token: String,
    pub model: String,
    pub ready_timeout_ms: u64,

    // 会话配置
    pub target_lang: String,
    pub voice: String,
    pub system_prompt: String,
    pub settle_delay_ms: u64,
    pub shutdown_grace_ms: u64,

    // 音频配置
    pub input_device: String,
    pub capture_mode: &'static str,
    pub playback: &'static str,
    pub playback_device: String,
    pub redirect_device: String,
    pub stream_format: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub capture_pipe_capacity: usize,
    pub redirect_pipe_capacity: usize,
    pub record_to_file: bool,
    pub audio_dir: String,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            // 网络配置
            ws_url: env!("WS_URL").to_string(),
            ws_token: env!("WS_TOKEN").to_string(),
            model: env!("REALTIME_MODEL").to_string(),
            ready_timeout_ms: env!("READY_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse READY_TIMEOUT_MS")?,

            // 会话配置
            target_lang: env!("SESSION_TARGET_LANG").to_string(),
            voice: env!("SESSION_VOICE").to_string(),
            system_prompt: env!("SESSION_SYSTEM_PROMPT").to_string(),
            settle_delay_ms: env!("SESSION_SETTLE_DELAY_MS").parse()
                .map_err(|_| "Failed to parse SESSION_SETTLE_DELAY_MS")?,
            shutdown_grace_ms: env!("SESSION_SHUTDOWN_GRACE_MS").parse()
                .map_err(|_| "Failed to parse SESSION_SHUTDOWN_GRACE_MS")?,

            // 音频配置
            input_device: env!("AUDIO_INPUT_DEVICE").to_string(),
            capture_mode: env!("AUDIO_CAPTURE_MODE"),
            playback: env!("AUDIO_PLAYBACK"),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
            redirect_device: env!("AUDIO_REDIRECT_DEVICE").to_string(),
            stream_format: env!("AUDIO_STREAM_FORMAT"),
            sample_rate: env!("AUDIO_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
            channels: env!("AUDIO_CHANNELS").parse()
                .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
            frame_size: env!("AUDIO_FRAME_SIZE").parse()
                .map_err(|_| "Failed to parse AUDIO_FRAME_SIZE")?,
            capture_pipe_capacity: env!("AUDIO_CAPTURE_PIPE_CAPACITY").parse()
                .map_err(|_| "Failed to parse AUDIO_CAPTURE_PIPE_CAPACITY")?,
            redirect_pipe_capacity: env!("AUDIO_REDIRECT_PIPE_CAPACITY").parse()
                .map_err(|_| "Failed to parse AUDIO_REDIRECT_PIPE_CAPACITY")?,
            record_to_file: env!("AUDIO_RECORD_TO_FILE").parse()
                .map_err(|_| "Failed to parse AUDIO_RECORD_TO_FILE")?,
            audio_dir: env!("AUDIO_DIR").to_string(),
        })
    }

    /// 运行时覆盖，`lookup` 一般为进程环境变量
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("REALTIME_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.ws_token = token;
        }
        if let Some(model) = get("REALTIME_MODEL") {
            self.model = model;
        }
        if let Some(url) = get("REALTIME_WS_URL") {
            self.ws_url = url;
        }
        if let Some(device) = get("AUDIO_DEVICE") {
            self.input_device = device;
        }
        if let Some(lang) = get("TARGET_LANG") {
            self.target_lang = lang;
        }
        if let Some(voice) = get("VOICE") {
            self.voice = voice;
        }
    }

    pub fn recorder_kind(&self) -> RecorderKind {
        match self.capture_mode {
            "output" | "loopback" => RecorderKind::OutputCapture,
            _ => RecorderKind::Capture,
        }
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        match self.playback {
            "redirect" => PlaybackMode::Redirect,
            "none" => PlaybackMode::None,
            _ => PlaybackMode::Speaker,
        }
    }

    pub fn audio_dir(&self) -> PathBuf {
        if self.audio_dir.is_empty() {
            default_audio_dir()
        } else {
            PathBuf::from(&self.audio_dir)
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            target_lang: self.target_lang.clone(),
            voice: self.voice.clone(),
            system_prompt: self.system_prompt.clone(),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            audio_dir: self.audio_dir(),
            record_to_file: self.record_to_file,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            ws_url: self.ws_url.clone(),
            token: self.ws_token.clone(),
            model: self.model.clone(),
        }
    }
}

use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    network: Network,
    session: Session,
    audio: Audio,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    model: String,
    ready_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Session {
    target_lang: String,
    voice: String,
    system_prompt: String,
    settle_delay_ms: u64,
    shutdown_grace_ms: u64,
}

#[derive(Deserialize)]
struct Audio {
    input_device: String,
    capture_mode: String,
    playback: String,
    playback_device: String,
    redirect_device: String,
    stream_format: String,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    capture_pipe_capacity: usize,
    redirect_pipe_capacity: usize,
    record_to_file: bool,
    audio_dir: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=REALTIME_MODEL={}", config.network.model);
    println!("cargo:rustc-env=READY_TIMEOUT_MS={}", config.network.ready_timeout_ms);

    // 会话配置
    println!("cargo:rustc-env=SESSION_TARGET_LANG={}", config.session.target_lang);
    println!("cargo:rustc-env=SESSION_VOICE={}", config.session.voice);
    println!("cargo:rustc-env=SESSION_SYSTEM_PROMPT={}", config.session.system_prompt);
    println!("cargo:rustc-env=SESSION_SETTLE_DELAY_MS={}", config.session.settle_delay_ms);
    println!("cargo:rustc-env=SESSION_SHUTDOWN_GRACE_MS={}", config.session.shutdown_grace_ms);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_INPUT_DEVICE={}", config.audio.input_device);
    println!("cargo:rustc-env=AUDIO_CAPTURE_MODE={}", config.audio.capture_mode);
    println!("cargo:rustc-env=AUDIO_PLAYBACK={}", config.audio.playback);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_REDIRECT_DEVICE={}", config.audio.redirect_device);
    println!("cargo:rustc-env=AUDIO_STREAM_FORMAT={}", config.audio.stream_format);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_FRAME_SIZE={}", config.audio.frame_size);
    println!("cargo:rustc-env=AUDIO_CAPTURE_PIPE_CAPACITY={}", config.audio.capture_pipe_capacity);
    println!("cargo:rustc-env=AUDIO_REDIRECT_PIPE_CAPACITY={}", config.audio.redirect_pipe_capacity);
    println!("cargo:rustc-env=AUDIO_RECORD_TO_FILE={}", config.audio.record_to_file);
    println!("cargo:rustc-env=AUDIO_DIR={}", config.audio.audio_dir);
}

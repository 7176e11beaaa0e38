use std::sync::Arc;

use anyhow::Context;
use tokio::signal;

use voxlink_rs::audio::{
    AudioDriver, CpalDriver, DeviceCatalog, DriverLifecycle, PlaybackSink, Recorder, RedirectSink,
    SpeakerSink, create_decoder,
};
use voxlink_rs::config::{Config, PlaybackMode};
use voxlink_rs::net_link::WebSocketTransport;
use voxlink_rs::session::Session;
use voxlink_rs::transport::Transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，运行时环境变量优先
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    log::debug!("Config: {}", serde_json::to_string(&config)?);

    let driver: Arc<dyn AudioDriver> = Arc::new(CpalDriver::new());
    let lifecycle = DriverLifecycle::new(driver);

    if std::env::args().nth(1).as_deref() == Some("devices") {
        let _guard = lifecycle.guard()?;
        print_devices(&lifecycle.driver().catalog()?);
        return Ok(());
    }

    if config.ws_token.is_empty() {
        log::warn!("No API key configured; set REALTIME_API_KEY or OPENAI_API_KEY");
    }

    // 启动网络链接
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::spawn(config.link_config()));

    let recorder = Recorder::with_capacity(
        config.recorder_kind(),
        lifecycle.clone(),
        config.capture_pipe_capacity,
    )
    .context("failed to initialize audio capture")?;
    let session = Session::new(transport, recorder, config.session_config())?;

    session.wait_until_ready().await;

    // 下行解码与播放
    let decoder = create_decoder(config.stream_format, config.sample_rate, config.channels)?;
    let sink: Option<Box<dyn PlaybackSink>> = match config.playback_mode() {
        PlaybackMode::Speaker => Some(Box::new(
            SpeakerSink::open(&config.playback_device, decoder.sample_rate(), decoder.channels())
                .context("failed to open speaker playback")?,
        )),
        PlaybackMode::Redirect => Some(Box::new(
            RedirectSink::open(
                &lifecycle,
                &config.redirect_device,
                decoder.sample_rate(),
                decoder.channels(),
                config.frame_size,
                config.redirect_pipe_capacity,
            )
            .context("failed to open redirect output")?,
        )),
        PlaybackMode::None => None,
    };
    session.attach_playback(decoder, sink)?;

    let recording = match session.start(&config.input_device) {
        Ok(recording) => recording,
        Err(e) => {
            session.stop().await;
            return Err(e);
        }
    };
    log::info!(
        "Session {} capturing from '{}' ({}), press Ctrl+C to stop",
        session.id(),
        recording.device.name,
        recording.device.host_api
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
        _ = session.wait_closed() => {
            log::info!("Realtime link closed, shutting down...");
        }
    }

    session.stop().await;
    if let Some(path) = session.archive_path() {
        println!("Received audio saved to {}", path.display());
    }
    Ok(())
}

fn print_devices(catalog: &DeviceCatalog) {
    for api in &catalog.apis {
        let default_mark = if catalog.default_host.as_deref() == Some(api.name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("{}{}:", api.name, default_mark);
        for dev in &api.devices {
            let mut marks = Vec::new();
            if api.default_input.as_deref() == Some(dev.name.as_str()) {
                marks.push("default input");
            }
            if api.default_output.as_deref() == Some(dev.name.as_str()) {
                marks.push("default output");
            }
            if dev.is_loopback() {
                marks.push("loopback");
            }
            println!(
                "  [{}] {} (in: {}, out: {}, {} Hz){}",
                dev.index,
                dev.name,
                dev.max_input_channels,
                dev.max_output_channels,
                dev.default_sample_rate,
                if marks.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", marks.join(", "))
                }
            );
        }
    }
}

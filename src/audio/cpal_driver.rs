//! [`AudioDriver`] backed by cpal.

use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};

use super::catalog::{DeviceCatalog, DeviceDescriptor, HostApi};
use super::driver::{ActiveStream, AudioDriver, StreamParams};
use super::error::{AudioError, Result};
use super::pipe::{PipeReader, PipeWriter};

const FALLBACK_SAMPLE_RATE: u32 = 48000;

#[derive(Default)]
pub struct CpalDriver {
    initialized: AtomicBool,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AudioError::driver_init("cpal driver used before initialization"))
        }
    }
}

impl AudioDriver for CpalDriver {
    fn name(&self) -> &str {
        "cpal"
    }

    fn initialize(&self) -> Result<()> {
        if cpal::available_hosts().is_empty() {
            return Err(AudioError::driver_init("no audio host available"));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn catalog(&self) -> Result<DeviceCatalog> {
        let mut apis = Vec::new();
        for id in cpal::available_hosts() {
            apis.push(describe_host(id)?);
        }
        let default_host = Some(cpal::default_host().id().name().to_string());
        Ok(DeviceCatalog::new(apis, default_host))
    }

    fn open_input(
        &self,
        device: &DeviceDescriptor,
        params: StreamParams,
        sink: PipeWriter,
    ) -> Result<ActiveStream> {
        self.ensure_initialized()?;
        let target = device.clone();
        let label = device.name.clone();

        ActiveStream::spawn("audio-capture", &device.name, move || {
            let dev = resolve_device(&target)?;
            let config = stream_config(params);
            let device_name = target.name.clone();

            let stream = dev
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // 实时回调：只拷贝并投递，绝不阻塞
                        sink.offer(data.to_vec());
                    },
                    move |err| log::error!("Input stream error on '{}': {}", device_name, err),
                    None,
                )
                .map_err(|e| AudioError::stream_open(&label, e))?;
            stream.play().map_err(|e| AudioError::stream_open(&label, e))?;

            log::info!(
                "Capturing '{}' ({} Hz, {} ch, buffer {:?})",
                target.name,
                params.sample_rate,
                params.channels,
                params.buffer_frames
            );
            Ok(stream)
        })
    }

    fn open_output(
        &self,
        device: &DeviceDescriptor,
        params: StreamParams,
        mut source: PipeReader,
    ) -> Result<ActiveStream> {
        self.ensure_initialized()?;
        let target = device.clone();
        let label = device.name.clone();

        ActiveStream::spawn("audio-redirect", &device.name, move || {
            let dev = resolve_device(&target)?;
            let config = stream_config(params);
            let device_name = target.name.clone();
            let mut pending: Vec<f32> = Vec::new();

            let stream = dev
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        // 先消费上次剩余的样本，不足时补静音
                        let mut filled = 0;
                        while filled < data.len() {
                            if pending.is_empty() {
                                match source.try_recv() {
                                    Some(batch) => pending = batch,
                                    None => break,
                                }
                            }
                            let n = pending.len().min(data.len() - filled);
                            data[filled..filled + n].copy_from_slice(&pending[..n]);
                            pending.drain(..n);
                            filled += n;
                        }
                        data[filled..].fill(0.0);
                    },
                    move |err| log::error!("Output stream error on '{}': {}", device_name, err),
                    None,
                )
                .map_err(|e| AudioError::stream_open(&label, e))?;
            stream.play().map_err(|e| AudioError::stream_open(&label, e))?;

            log::info!(
                "Redirecting playback to '{}' ({} Hz, {} ch)",
                target.name,
                params.sample_rate,
                params.channels
            );
            Ok(stream)
        })
    }
}

fn stream_config(params: StreamParams) -> StreamConfig {
    StreamConfig {
        channels: params.channels,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: match params.buffer_frames {
            Some(frames) => BufferSize::Fixed(frames),
            None => BufferSize::Default,
        },
    }
}

fn describe_host(id: cpal::HostId) -> Result<HostApi> {
    let host = cpal::host_from_id(id)
        .map_err(|e| AudioError::enumeration(format!("host {}: {}", id.name(), e)))?;

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .devices()
        .map_err(|e| AudioError::enumeration(format!("host {}: {}", id.name(), e)))?
        .enumerate()
        .map(|(index, device)| {
            let input = device.default_input_config().ok();
            let output = device.default_output_config().ok();
            let default_sample_rate = input
                .as_ref()
                .or(output.as_ref())
                .map(|c| c.sample_rate().0)
                .unwrap_or(FALLBACK_SAMPLE_RATE);

            DeviceDescriptor {
                host_api: id.name().to_string(),
                name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
                index,
                max_input_channels: input.map(|c| c.channels()).unwrap_or(0),
                max_output_channels: output.map(|c| c.channels()).unwrap_or(0),
                default_sample_rate,
            }
        })
        .collect();

    Ok(HostApi {
        name: id.name().to_string(),
        devices,
        default_input,
        default_output,
    })
}

/// Find the live cpal device a descriptor was taken from.
fn resolve_device(target: &DeviceDescriptor) -> Result<cpal::Device> {
    let id = cpal::available_hosts()
        .into_iter()
        .find(|id| id.name() == target.host_api)
        .ok_or_else(|| AudioError::stream_open(&target.name, "host API no longer available"))?;
    let host = cpal::host_from_id(id).map_err(|e| AudioError::stream_open(&target.name, e))?;

    let mut by_name = None;
    let devices = host
        .devices()
        .map_err(|e| AudioError::stream_open(&target.name, e))?;
    for (index, device) in devices.enumerate() {
        let name = device.name().unwrap_or_default();
        if name == target.name {
            if index == target.index {
                return Ok(device);
            }
            by_name.get_or_insert(device);
        }
    }
    by_name.ok_or_else(|| AudioError::stream_open(&target.name, "device disappeared"))
}

//! audio - Device discovery, capture, playback and archiving
//!
//! Capture goes through a host driver (cpal) whose callbacks feed bounded
//! sample pipes. Playback goes either to ALSA on a dedicated thread or back
//! through the driver to a loopback device. Real-time I/O never runs on
//! tokio tasks.

mod alsa_device;
pub mod catalog;
pub mod cpal_driver;
pub mod driver;
pub mod error;
pub mod opus_codec;
pub mod pcm;
pub mod pipe;
pub mod playback;
pub mod recorder;
pub mod stream_decoder;
pub mod wav_writer;

pub use catalog::{DeviceCatalog, DeviceDescriptor, Direction, HostApi, SelectionPolicy};
pub use cpal_driver::CpalDriver;
pub use driver::{ActiveStream, AudioDriver, DriverGuard, DriverLifecycle, LatencyProfile, StreamParams};
pub use error::{AudioError, Result};
pub use pipe::{PipeReader, PipeStats, PipeWriter, SampleBatch, sample_pipe};
pub use playback::{PlaybackSink, RedirectSink, SpeakerSink, StreamBuffer};
pub use recorder::{Recorder, RecorderKind, Recording};
pub use stream_decoder::{Pcm16Decoder, StreamDecoder, create_decoder};
pub use wav_writer::{WavSpec, WavWriter};

//! Opus decoder with channel conversion for the downlink.

use anyhow::Result;

use super::pcm;
use super::stream_decoder::StreamDecoder;

/// Largest Opus frame: 120 ms at 48 kHz per channel.
const MAX_FRAME_SIZE: usize = 5760;

pub struct OpusDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
    stream_channels: u16,
    output_channels: u16,
}

impl OpusDecoder {
    /// Create a decoder producing `output_channels` at `sample_rate`.
    ///
    /// * `sample_rate`     - Decode rate; Opus accepts 8/12/16/24/48 kHz
    /// * `output_channels` - Channels of the decoded PCM (the stream itself
    ///   is decoded as mono or stereo and converted)
    pub fn new(sample_rate: u32, output_channels: u16) -> Result<Self> {
        let stream_channels: u16 = if output_channels == 1 { 1 } else { 2 };
        let channels = if stream_channels == 1 {
            opus::Channels::Mono
        } else {
            opus::Channels::Stereo
        };
        let decoder = opus::Decoder::new(sample_rate, channels)?;

        Ok(Self {
            decoder,
            sample_rate,
            stream_channels,
            output_channels: output_channels.max(1),
        })
    }

    /// Decode an Opus packet to interleaved PCM at the configured channels.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<i16>> {
        if opus_data.is_empty() {
            anyhow::bail!("empty Opus packet");
        }
        let mut pcm_buf = vec![0i16; MAX_FRAME_SIZE * self.stream_channels as usize];
        let decoded_per_ch = self.decoder.decode(opus_data, &mut pcm_buf, false)?;
        pcm_buf.truncate(decoded_per_ch * self.stream_channels as usize);

        Ok(pcm::convert_channels(
            &pcm_buf,
            self.stream_channels,
            self.output_channels,
        ))
    }
}

impl StreamDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        OpusDecoder::decode(self, data)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.output_channels
    }
}

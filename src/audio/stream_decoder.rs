//! Stream decoders turning inbound packets into interleaved i16 PCM.

use anyhow::Result;

use super::opus_codec::OpusDecoder;
use super::pcm;

/// A trait for audio stream decoders that convert inbound packets into
/// interleaved i16 PCM samples ready for playback and archiving.
///
/// Implementations handle format-specific decoding and channel conversion
/// internally.
pub trait StreamDecoder: Send {
    /// Decode one packet into interleaved i16 PCM samples.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>>;

    /// Sample rate of the decoded output.
    fn sample_rate(&self) -> u32;

    /// Channel count of the decoded output.
    fn channels(&self) -> u16;
}

/// Packets that already are little-endian PCM16 at the output format.
pub struct Pcm16Decoder {
    sample_rate: u32,
    channels: u16,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl StreamDecoder for Pcm16Decoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        if data.len() % 2 != 0 {
            anyhow::bail!("PCM16 packet has odd length {}", data.len());
        }
        Ok(pcm::pcm16_from_le_bytes(data))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// Factory function: create a decoder for the configured stream format.
pub fn create_decoder(
    stream_format: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<Box<dyn StreamDecoder>> {
    match stream_format {
        "opus" => Ok(Box::new(OpusDecoder::new(sample_rate, channels)?)),
        "pcm16" | "pcm" => Ok(Box::new(Pcm16Decoder::new(sample_rate, channels))),
        other => anyhow::bail!("Unsupported stream format: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_passthrough() {
        let mut decoder = create_decoder("pcm16", 24000, 1).unwrap();
        assert_eq!(decoder.decode(&[0x01, 0x00, 0xff, 0xff]).unwrap(), vec![1, -1]);
        assert_eq!(decoder.sample_rate(), 24000);
        assert!(decoder.decode(&[0x01]).is_err());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(create_decoder("mp3", 48000, 1).is_err());
    }
}

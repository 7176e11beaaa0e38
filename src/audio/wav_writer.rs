//! Streaming PCM WAV writer.
//!
//! The 44-byte header is written up front with both size fields zeroed and
//! patched once by [`WavWriter::finalize`]. Until then the file's header
//! does not describe its contents.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

pub const WAV_HEADER_SIZE: usize = 44;

const RIFF_SIZE_OFFSET: u64 = 4;
const DATA_SIZE_OFFSET: u64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl WavSpec {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * self.bits_per_sample as u32 / 8
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }
}

/// Build the canonical header. `data_size` of zero yields the placeholder
/// form with both size fields zeroed.
pub fn header(spec: WavSpec, data_size: u32) -> [u8; WAV_HEADER_SIZE] {
    let riff_size = if data_size == 0 { 0 } else { data_size + 36 };
    let mut h = [0u8; WAV_HEADER_SIZE];

    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&riff_size.to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");

    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes());
    h[22..24].copy_from_slice(&spec.channels.to_le_bytes());
    h[24..28].copy_from_slice(&spec.sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&spec.byte_rate().to_le_bytes());
    h[32..34].copy_from_slice(&spec.block_align().to_le_bytes());
    h[34..36].copy_from_slice(&spec.bits_per_sample.to_le_bytes());

    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_size.to_le_bytes());
    h
}

/// Largest data size whose RIFF size still fits in a `u32`.
pub const MAX_DATA_SIZE: u32 = u32::MAX - 36;

pub struct WavWriter<W: Write + Seek> {
    inner: W,
    spec: WavSpec,
    data_bytes: u64,
    finalized: bool,
}

impl WavWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P, spec: WavSpec) -> io::Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), spec)
    }
}

impl<W: Write + Seek> WavWriter<W> {
    /// Write the placeholder header and return a writer positioned at the
    /// start of the data region.
    pub fn new(mut inner: W, spec: WavSpec) -> io::Result<Self> {
        inner.write_all(&header(spec, 0))?;
        Ok(Self {
            inner,
            spec,
            data_bytes: 0,
            finalized: false,
        })
    }

    /// Append raw sample bytes. No frame alignment is assumed.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.finalized {
            return Err(io::Error::other("write after finalize"));
        }
        self.inner.write_all(bytes)?;
        self.data_bytes += bytes.len() as u64;
        Ok(())
    }

    pub fn write_samples(&mut self, samples: &[i16]) -> io::Result<()> {
        self.write(&super::pcm::pcm16_to_le_bytes(samples))
    }

    /// Patch both size fields with the bytes written so far. Only the first
    /// call touches the file.
    pub fn finalize(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        // RIFF 大小为 data + 36，同样不能超过 32 位
        let data_size = self.data_bytes.min(u64::from(MAX_DATA_SIZE)) as u32;
        self.inner.seek(SeekFrom::Start(DATA_SIZE_OFFSET))?;
        self.inner.write_all(&data_size.to_le_bytes())?;
        self.inner.seek(SeekFrom::Start(RIFF_SIZE_OFFSET))?;
        self.inner.write_all(&(data_size + 36).to_le_bytes())?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()
    }

    pub fn bytes_written(&self) -> u64 {
        self.data_bytes
    }

    pub fn duration_secs(&self) -> f64 {
        let rate = self.spec.byte_rate();
        if rate == 0 {
            0.0
        } else {
            self.data_bytes as f64 / rate as f64
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn spec(&self) -> WavSpec {
        self.spec
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn placeholder_header_layout() {
        let h = header(WavSpec::pcm16(48000, 1), 0);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(u32_at(&h, 4), 0);
        assert_eq!(&h[8..16], b"WAVEfmt ");
        assert_eq!(u32_at(&h, 16), 16);
        assert_eq!(u16::from_le_bytes([h[20], h[21]]), 1);
        assert_eq!(u16::from_le_bytes([h[22], h[23]]), 1);
        assert_eq!(u32_at(&h, 24), 48000);
        assert_eq!(u32_at(&h, 28), 96000);
        assert_eq!(u16::from_le_bytes([h[32], h[33]]), 2);
        assert_eq!(u16::from_le_bytes([h[34], h[35]]), 16);
        assert_eq!(&h[36..40], b"data");
        assert_eq!(u32_at(&h, 40), 0);
    }

    #[test]
    fn finalize_patches_sizes_for_unaligned_writes() {
        let mut writer = WavWriter::new(Cursor::new(Vec::new()), WavSpec::pcm16(24000, 2)).unwrap();
        let chunks: [&[u8]; 4] = [&[1, 2, 3], &[4], &[], &[5, 6, 7, 8, 9, 10, 11]];
        for chunk in chunks {
            writer.write(chunk).unwrap();
        }
        writer.finalize().unwrap();
        assert_eq!(writer.bytes_written(), 11);

        let bytes = writer.into_inner().into_inner();
        assert_eq!(bytes.len(), WAV_HEADER_SIZE + 11);
        assert_eq!(u32_at(&bytes, 40), 11);
        assert_eq!(u32_at(&bytes, 4), 11 + 36);
        assert_eq!(&bytes[44..], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn finalize_twice_is_harmless() {
        let mut writer = WavWriter::new(Cursor::new(Vec::new()), WavSpec::pcm16(48000, 1)).unwrap();
        writer.write_samples(&[1, -1, 2]).unwrap();
        writer.finalize().unwrap();
        writer.finalize().unwrap();
        assert!(writer.write(&[0]).is_err());

        let bytes = writer.into_inner().into_inner();
        assert_eq!(bytes.len(), WAV_HEADER_SIZE + 6);
        assert_eq!(u32_at(&bytes, 40), 6);
        assert_eq!(u32_at(&bytes, 4), 42);
    }

    #[test]
    fn empty_recording_is_still_valid() {
        let mut writer = WavWriter::new(Cursor::new(Vec::new()), WavSpec::pcm16(48000, 1)).unwrap();
        writer.finalize().unwrap();
        let bytes = writer.into_inner().into_inner();
        assert_eq!(bytes.len(), WAV_HEADER_SIZE);
        assert_eq!(u32_at(&bytes, 40), 0);
        assert_eq!(u32_at(&bytes, 4), 36);
    }

    /// Discards data, keeps the header bytes.
    struct HeaderOnly {
        header: [u8; WAV_HEADER_SIZE],
        pos: u64,
        end: u64,
    }

    impl HeaderOnly {
        fn new() -> Self {
            Self {
                header: [0; WAV_HEADER_SIZE],
                pos: 0,
                end: 0,
            }
        }
    }

    impl Write for HeaderOnly {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            for (i, b) in buf.iter().enumerate() {
                let at = self.pos + i as u64;
                if at < WAV_HEADER_SIZE as u64 {
                    self.header[at as usize] = *b;
                } else {
                    break;
                }
            }
            self.pos += buf.len() as u64;
            self.end = self.end.max(self.pos);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for HeaderOnly {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.pos = match pos {
                SeekFrom::Start(n) => n,
                SeekFrom::End(n) => self.end.saturating_add_signed(n),
                SeekFrom::Current(n) => self.pos.saturating_add_signed(n),
            };
            Ok(self.pos)
        }
    }

    #[test]
    fn oversized_recording_clamps_header_sizes() {
        let mut writer = WavWriter::new(HeaderOnly::new(), WavSpec::pcm16(24000, 1)).unwrap();
        let chunk = vec![0u8; 1 << 20];
        let target = u64::from(u32::MAX - 10);
        while writer.bytes_written() + chunk.len() as u64 <= target {
            writer.write(&chunk).unwrap();
        }
        let rest = (target - writer.bytes_written()) as usize;
        writer.write(&chunk[..rest]).unwrap();
        assert_eq!(writer.bytes_written(), target);

        writer.finalize().unwrap();
        let sink = writer.into_inner();
        assert_eq!(u32_at(&sink.header, 40), MAX_DATA_SIZE);
        assert_eq!(u32_at(&sink.header, 4), u32::MAX);
        assert_eq!(sink.pos, WAV_HEADER_SIZE as u64 + target);
    }

    #[test]
    fn file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut writer = WavWriter::create(&path, WavSpec::pcm16(48000, 1)).unwrap();
        writer.write_samples(&vec![1000i16; 960]).unwrap();
        assert!((writer.duration_secs() - 0.02).abs() < 1e-9);
        writer.finalize().unwrap();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), WAV_HEADER_SIZE + 1920);
        assert_eq!(u32_at(&bytes, 40), 1920);
        assert_eq!(u32_at(&bytes, 4), 1956);
    }
}

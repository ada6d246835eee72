use std::io::Read;

use bytes::BytesMut;

use crate::error::{Error, Result};

const BYTES_PER_SAMPLE: usize = 2;

/// Planar block of normalized samples, one buffer per channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleBlock {
    channels: Vec<Vec<f32>>,
    frame_count: usize,
}

impl SampleBlock {
    pub fn new(channels: Vec<Vec<f32>>) -> Result<Self> {
        let frame_count = channels.first().map(|c| c.len()).unwrap_or(0);
        if let Some((i, c)) = channels
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != frame_count)
        {
            return Err(Error::invalid_input(format!(
                "channel {} has {} frames, expected {}",
                i,
                c.len(),
                frame_count
            )));
        }
        Ok(Self {
            channels,
            frame_count,
        })
    }

    /// Zero-length block; submitting it signals end of input.
    pub fn end_of_input() -> Self {
        Self::default()
    }

    pub fn silence(channels: usize, frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels],
            frame_count: frames,
        }
    }

    /// Build from interleaved signed 16-bit little-endian PCM. Trailing bytes
    /// that do not form a whole frame are ignored.
    pub fn from_interleaved_i16_le(data: &[u8], channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(Error::invalid_input("zero channels"));
        }
        let frame_bytes = channels * BYTES_PER_SAMPLE;
        let frames = data.len() / frame_bytes;
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for frame in data.chunks_exact(frame_bytes) {
            for (ch, sample) in frame.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
                let value = i16::from_le_bytes([sample[0], sample[1]]);
                planar[ch].push(value as f32 / 32768.0);
            }
        }
        Ok(Self {
            channels: planar,
            frame_count: frames,
        })
    }

    /// Append this block to `out` as interleaved signed 16-bit little-endian PCM.
    pub fn write_interleaved_i16_le(&self, out: &mut Vec<u8>) {
        out.reserve(self.frame_count * self.channels.len() * BYTES_PER_SAMPLE);
        for i in 0..self.frame_count {
            for channel in &self.channels {
                let value = (channel[i] * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn is_end_of_input(&self) -> bool {
        self.frame_count == 0
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }
}

/// Reads fixed-size blocks of interleaved 16-bit PCM from a byte source.
///
/// The read buffer belongs to this reader and lives as long as it does.
pub struct PcmReader<R> {
    source: R,
    channels: usize,
    buf: BytesMut,
    eof: bool,
}

impl<R: Read> PcmReader<R> {
    pub fn new(source: R, channels: usize, block_frames: usize) -> Result<Self> {
        if channels == 0 || block_frames == 0 {
            return Err(Error::invalid_input(format!(
                "pcm reader needs channels and block size, got {}x{}",
                channels, block_frames
            )));
        }
        Ok(Self {
            source,
            channels,
            buf: BytesMut::zeroed(channels * block_frames * BYTES_PER_SAMPLE),
            eof: false,
        })
    }

    /// Next block of samples. Returns an end-of-input block once the source is
    /// exhausted, and keeps returning it on later calls.
    pub fn next_block(&mut self) -> Result<SampleBlock> {
        if self.eof {
            return Ok(SampleBlock::end_of_input());
        }
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.source.read(&mut self.buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let frame_bytes = self.channels * BYTES_PER_SAMPLE;
        let partial = filled % frame_bytes;
        if partial != 0 {
            log::warn!("dropping {} trailing bytes of a partial frame", partial);
        }
        SampleBlock::from_interleaved_i16_le(&self.buf[..filled - partial], self.channels)
    }
}

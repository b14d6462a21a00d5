//! Decoder over PCM that is already in memory.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::Path;
use std::sync::Arc;

use loopstream_core::{Error, Result};
use tracing::debug;

use crate::chunk::CHANNELS;
use crate::decode::{Decoder, DecoderFactory};

/// Serves interleaved stereo `f32` samples from a shared buffer.
///
/// The path given to `open` is ignored; opening rewinds to the start.
#[derive(Debug, Clone)]
pub struct MemoryDecoder {
    samples: Arc<[f32]>,
    /// Read position in samples.
    position: usize,
    sample_rate: u32,
    seekable: bool,
    open: bool,
}

impl MemoryDecoder {
    /// Create a decoder over interleaved stereo samples at `sample_rate`.
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            position: 0,
            sample_rate,
            seekable: true,
            open: false,
        }
    }

    /// Reject every seek, like a format without an index.
    pub const fn without_seek(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// Factory handing out independent decoders over the same samples.
    pub fn factory(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> DecoderFactory {
        let template = Self::new(samples, sample_rate);
        Box::new(move || Box::new(template.clone()))
    }

    /// Current read position in frames.
    pub const fn position_frames(&self) -> usize {
        self.position / CHANNELS
    }

    fn frames(&self) -> usize {
        self.samples.len() / CHANNELS
    }
}

impl Decoder for MemoryDecoder {
    fn open(&mut self, _path: &Path, _sample_rate: u32, _thread_hint: usize) -> Result<()> {
        self.position = 0;
        self.open = true;
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        if !self.seekable {
            return Err(Error::Seek("source does not support seeking".to_string()));
        }
        if !seconds.is_finite() || seconds < 0.0 || seconds > self.duration() {
            return Err(Error::Seek(format!(
                "target {seconds:.3}s is outside 0..{:.3}s",
                self.duration()
            )));
        }

        let frame = ((seconds * f64::from(self.sample_rate)) as usize).min(self.frames());
        self.position = frame * CHANNELS;
        debug!("Memory decoder positioned at frame {frame}");
        Ok(())
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        if !self.open {
            return Ok(0);
        }
        let remaining = &self.samples[self.position..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.open = false;
        self.position = 0;
    }

    fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        CHANNELS as u16
    }
}

//! FFmpeg-based decoding for formats symphonia cannot handle.
//!
//! The `ffmpeg` binary decodes and resamples the whole file up front; the
//! result is served from memory.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use loopstream_core::{Error, Result};
use tracing::{debug, info};

use crate::chunk::CHANNELS;
use crate::decode::{Decoder, DecoderFactory};
use crate::memory::MemoryDecoder;

/// FFmpeg decoder producing stereo `f32` at the requested sample rate.
#[derive(Default)]
pub struct FfmpegDecoder {
    inner: Option<MemoryDecoder>,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing ffmpeg decoders.
    pub fn factory() -> DecoderFactory {
        Box::new(|| Box::new(Self::new()))
    }

    /// Get the path to the ffmpeg binary.
    ///
    /// A copy in the project cache directory wins over `PATH`.
    fn ffmpeg_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "loopstream")
            .map(|d| d.cache_dir().join("ffmpeg"))
            .filter(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }
}

impl Decoder for FfmpegDecoder {
    fn open(&mut self, path: &Path, sample_rate: u32, thread_hint: usize) -> Result<()> {
        self.close();

        if !path.exists() {
            return Err(Error::Open(format!("{} does not exist", path.display())));
        }

        let ffmpeg_path = Self::ffmpeg_path();
        info!("Decoding {} with {}", path.display(), ffmpeg_path.display());

        // -threads N       = decoder thread hint (0 = auto)
        // -f f32le         = output format: 32-bit float little-endian
        // -ar / -ac        = resample to the output rate, stereo
        // pipe:1           = write to stdout
        let rate = sample_rate.to_string();
        let threads = thread_hint.to_string();
        let output = Command::new(&ffmpeg_path)
            .args(["-threads", threads.as_str(), "-i"])
            .arg(path)
            .args([
                "-f",
                "f32le",
                "-acodec",
                "pcm_f32le",
                "-ar",
                rate.as_str(),
                "-ac",
                "2",
                "-v",
                "quiet",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| Error::Open(format!("Failed to run ffmpeg: {e}")))?;

        if !output.status.success() {
            return Err(Error::Open(format!(
                "ffmpeg exited with {}",
                output.status
            )));
        }
        if output.stdout.is_empty() {
            return Err(Error::Open("ffmpeg produced no output".to_string()));
        }

        let samples = bytes_to_f32(&output.stdout);
        debug!(
            "Decoded {} frames with ffmpeg",
            samples.len() / CHANNELS
        );

        let mut inner = MemoryDecoder::new(samples, sample_rate);
        inner.open(path, sample_rate, thread_hint)?;
        self.inner = Some(inner);
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.inner.as_mut().ok_or(Error::NotOpen)?.seek(seconds)
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(out),
            None => Ok(0),
        }
    }

    fn close(&mut self) {
        self.inner = None;
    }

    fn duration(&self) -> f64 {
        self.inner.as_ref().map_or(0.0, Decoder::duration)
    }

    fn sample_rate(&self) -> u32 {
        self.inner.as_ref().map_or(0, Decoder::sample_rate)
    }

    fn channels(&self) -> u16 {
        CHANNELS as u16
    }
}

/// Convert raw bytes (f32le) to f32 samples.
fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

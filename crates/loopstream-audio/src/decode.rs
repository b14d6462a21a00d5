//! Decoder collaborators.
//!
//! The engine pulls interleaved stereo `f32` samples through the [`Decoder`]
//! trait. Implementations are created on demand by a [`DecoderFactory`] so the
//! buffer manager can open a new stream without disturbing the current one.

use std::fs::File;
use std::path::Path;

use loopstream_core::{Error, Result};
use symphonia::core::{
    audio::{AudioBuffer, AudioBufferRef},
    codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL},
    conv::FromSample,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    sample::Sample,
    units::{Time, TimeBase},
};
use tracing::{debug, error, trace};

use crate::chunk::CHANNELS;

/// Pull-based PCM source producing interleaved stereo `f32` samples.
pub trait Decoder: Send {
    /// Open a stream. `sample_rate` is the rate the caller needs; decoders that
    /// cannot convert report their native rate and let the caller decide.
    fn open(&mut self, path: &Path, sample_rate: u32, thread_hint: usize) -> Result<()>;

    /// Seek to a position in seconds.
    fn seek(&mut self, seconds: f64) -> Result<()>;

    /// Fill `out` with interleaved samples.
    ///
    /// Returns fewer than `out.len()` samples only at end of stream; zero
    /// means the stream is exhausted.
    fn read(&mut self, out: &mut [f32]) -> Result<usize>;

    /// Release the stream. Safe to call more than once.
    fn close(&mut self);

    /// Total duration in seconds, 0.0 if unknown.
    fn duration(&self) -> f64;

    /// Sample rate of the samples returned by `read`.
    fn sample_rate(&self) -> u32;

    /// Channel count of the samples returned by `read`.
    fn channels(&self) -> u16;

    /// Total length in frames.
    fn total_frames(&self) -> u64 {
        let frames = self.duration() * f64::from(self.sample_rate());
        if frames.is_finite() && frames > 0.0 {
            frames as u64
        } else {
            0
        }
    }
}

/// Creates fresh decoders for each opened stream.
pub type DecoderFactory = Box<dyn Fn() -> Box<dyn Decoder> + Send>;

/// State of an opened file.
struct OpenStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    sample_rate: u32,
    time_base: Option<TimeBase>,
    duration: f64,
}

/// Streaming file decoder wrapping symphonia.
///
/// Output is always stereo: mono is duplicated and channels past the second
/// are dropped. The native sample rate is reported unchanged.
#[derive(Default)]
pub struct SymphoniaDecoder {
    stream: Option<OpenStream>,
    /// Decoded samples not yet handed out.
    pending: Vec<f32>,
    pending_pos: usize,
    /// Frames to discard after an accurate seek landed early.
    skip_frames: usize,
}

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing symphonia decoders.
    pub fn factory() -> DecoderFactory {
        Box::new(|| Box::new(Self::new()))
    }

    /// Decode the next packet into `pending`. Returns false at end of stream.
    fn decode_next(&mut self) -> Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };

        loop {
            let packet = match stream.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => {
                    return Err(Error::Decode(format!("Failed to read packet: {e}")));
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != stream.track_id {
                continue;
            }

            match stream.decoder.decode(&packet) {
                Ok(decoded) => {
                    self.pending.clear();
                    self.pending_pos = 0;
                    append_stereo(&decoded, &mut self.pending);

                    if self.skip_frames > 0 {
                        let skip = (self.skip_frames * CHANNELS).min(self.pending.len());
                        self.pending_pos = skip;
                        self.skip_frames -= skip / CHANNELS;
                    }
                    return Ok(true);
                }
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    // Log and skip corrupt frames
                    error!("Decode error (skipping): {e}");
                }
                Err(e) => {
                    return Err(Error::Decode(format!("Decode failed: {e}")));
                }
            }
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn open(&mut self, path: &Path, sample_rate: u32, thread_hint: usize) -> Result<()> {
        self.close();

        let file = File::open(path)
            .map_err(|e| Error::Open(format!("{}: {e}", path.display())))?;
        let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|e| Error::Open(format!("Failed to probe format: {e}")))?;

        let format = probed.format;

        // Find the first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Open("No audio tracks found".to_string()))?;

        let track_id = track.id;
        let native_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::Open("Track has no sample rate".to_string()))?;
        let time_base = track.codec_params.time_base;
        let duration = match (time_base, track.codec_params.n_frames) {
            (Some(tb), Some(n_frames)) => {
                let time = tb.calc_time(n_frames);
                time.seconds as f64 + time.frac
            }
            _ => 0.0,
        };

        debug!(
            "Audio track: id={}, native_rate={}, requested_rate={}, duration={:.2}s",
            track_id, native_rate, sample_rate, duration
        );
        trace!("Thread hint {thread_hint} ignored by symphonia");

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Open(format!("Failed to create decoder: {e}")))?;

        self.stream = Some(OpenStream {
            format,
            decoder,
            track_id,
            sample_rate: native_rate,
            time_base,
            duration,
        });
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotOpen)?;

        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::Seek(format!("invalid target {seconds}")));
        }
        if stream.duration > 0.0 && seconds > stream.duration {
            return Err(Error::Seek(format!(
                "target {seconds:.2}s is beyond duration {:.2}s",
                stream.duration
            )));
        }

        let seeked = stream
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds),
                    track_id: Some(stream.track_id),
                },
            )
            .map_err(|e| Error::Seek(e.to_string()))?;

        // Reset decoder state
        stream.decoder.reset();

        self.pending.clear();
        self.pending_pos = 0;
        self.skip_frames = match stream.time_base {
            Some(tb) if seeked.required_ts > seeked.actual_ts => {
                let early = tb.calc_time(seeked.required_ts - seeked.actual_ts);
                ((early.seconds as f64 + early.frac) * f64::from(stream.sample_rate)) as usize
            }
            _ => 0,
        };

        debug!(
            "Seeked to {:.3}s, skipping {} frames",
            seconds, self.skip_frames
        );
        Ok(())
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let mut total = 0;

        while total < out.len() {
            if self.pending_pos >= self.pending.len() && !self.decode_next()? {
                break; // End of stream
            }

            let available = &self.pending[self.pending_pos..];
            let n = available.len().min(out.len() - total);
            out[total..total + n].copy_from_slice(&available[..n]);
            self.pending_pos += n;
            total += n;
        }

        Ok(total)
    }

    fn close(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.pending_pos = 0;
        self.skip_frames = 0;
    }

    fn duration(&self) -> f64 {
        self.stream.as_ref().map_or(0.0, |s| s.duration)
    }

    fn sample_rate(&self) -> u32 {
        self.stream.as_ref().map_or(0, |s| s.sample_rate)
    }

    fn channels(&self) -> u16 {
        CHANNELS as u16
    }
}

/// Append a decoded buffer to `out` as interleaved stereo `f32`.
fn append_stereo(buffer: &AudioBufferRef<'_>, out: &mut Vec<f32>) {
    match buffer {
        AudioBufferRef::U8(buf) => push_stereo(&**buf, out),
        AudioBufferRef::U16(buf) => push_stereo(&**buf, out),
        AudioBufferRef::U24(buf) => push_stereo(&**buf, out),
        AudioBufferRef::U32(buf) => push_stereo(&**buf, out),
        AudioBufferRef::S8(buf) => push_stereo(&**buf, out),
        AudioBufferRef::S16(buf) => push_stereo(&**buf, out),
        AudioBufferRef::S24(buf) => push_stereo(&**buf, out),
        AudioBufferRef::S32(buf) => push_stereo(&**buf, out),
        AudioBufferRef::F32(buf) => push_stereo(&**buf, out),
        AudioBufferRef::F64(buf) => push_stereo(&**buf, out),
    }
}

fn push_stereo<S>(buffer: &AudioBuffer<S>, out: &mut Vec<f32>)
where
    S: Sample,
    f32: FromSample<S>,
{
    let planes = buffer.planes();
    let channel_planes = planes.planes();
    let Some(left) = channel_planes.first() else {
        return;
    };
    let right = channel_planes.get(1).unwrap_or(left);

    out.reserve(left.len() * CHANNELS);
    for (l, r) in left.iter().zip(right.iter()) {
        out.push(f32::from_sample(*l));
        out.push(f32::from_sample(*r));
    }
}

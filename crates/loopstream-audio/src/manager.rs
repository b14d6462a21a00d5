//! Producer side of the streaming engine.
//!
//! [`DecodeBufferManager`] owns the decoder and keeps the render queue near
//! its target depth. The first chunk of every stream doubles as the loop
//! chunk; when the render side splices into it, the manager rewinds the
//! decoder past that chunk and refills the queue while it plays.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::VecDeque;
use std::path::Path;

use loopstream_core::{EngineConfig, Error, Result, StreamInfo};
use tracing::{debug, error, info, trace, warn};

use crate::chunk::{Chunk, SharedChunk, CHANNELS};
use crate::decode::{Decoder, DecoderFactory};
use crate::position::PositionReconciler;
use crate::protocol::{ConsumerEvent, RenderLink, RenderMessage};

/// What the manager learned from one pass over the render events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSummary {
    /// The render side finished the stream with looping off.
    pub ended: bool,
    /// Loop restarts handled during this pass.
    pub loop_restarts: usize,
    /// Silent frames the render side reported since the previous pass.
    pub underrun_frames: u64,
}

/// Paces decoding against the render queue.
pub struct DecodeBufferManager {
    factory: DecoderFactory,
    decoder: Option<Box<dyn Decoder>>,
    link: RenderLink,
    config: EngineConfig,
    /// Output rate every decoder must match.
    sample_rate: u32,
    chunk_samples: usize,
    /// Length of the cached loop chunk in samples.
    loop_chunk_samples: usize,
    scratch: Vec<f32>,
    /// Messages the render ring had no room for, oldest first.
    backlog: VecDeque<RenderMessage>,
    info: Option<StreamInfo>,
    eof: bool,
    queue_estimate: usize,
    chunks_sent: u64,
    epoch: u64,
    looping: bool,
    reported_underruns: u64,
}

impl DecodeBufferManager {
    pub fn new(
        factory: DecoderFactory,
        link: RenderLink,
        config: EngineConfig,
        sample_rate: u32,
    ) -> Self {
        let chunk_samples = config.chunk_frames(sample_rate) * CHANNELS;
        Self {
            factory,
            decoder: None,
            link,
            config,
            sample_rate,
            chunk_samples,
            loop_chunk_samples: 0,
            scratch: vec![0.0; chunk_samples],
            backlog: VecDeque::new(),
            info: None,
            eof: false,
            queue_estimate: 0,
            chunks_sent: 0,
            epoch: 0,
            looping: false,
            reported_underruns: 0,
        }
    }

    /// Open a stream and prime the render side with its first chunk.
    ///
    /// On failure the previously open stream keeps playing untouched.
    pub fn open(&mut self, path: &Path) -> Result<StreamInfo> {
        let mut decoder = (self.factory)();
        decoder
            .open(path, self.sample_rate, self.config.decoder_threads)
            .map_err(|e| match e {
                Error::Open(_) => e,
                other => Error::Open(other.to_string()),
            })?;

        let native = decoder.sample_rate();
        if native != self.sample_rate {
            decoder.close();
            warn!(
                "Rejecting {}: decoder rate {} Hz, output rate {} Hz",
                path.display(),
                native,
                self.sample_rate
            );
            return Err(Error::SampleRateMismatch {
                native,
                required: self.sample_rate,
            });
        }

        let channels = decoder.channels();
        if usize::from(channels) != CHANNELS {
            decoder.close();
            return Err(Error::Open(format!(
                "decoder produced {channels} channels, expected {CHANNELS}"
            )));
        }

        let info = StreamInfo::new(decoder.duration(), native, channels);
        if let Some(mut previous) = self.decoder.replace(decoder) {
            previous.close();
        }

        self.begin_epoch();
        self.send(RenderMessage::ResetPosition);
        self.chunk_samples = self.config.chunk_frames(self.sample_rate) * CHANNELS;
        self.scratch.resize(self.chunk_samples, 0.0);
        self.loop_chunk_samples = 0;
        self.info = Some(info);

        // The first chunk is both the loop chunk and the first regular chunk.
        let n = self.read_chunk();
        if n == 0 {
            warn!("{} decoded to nothing", path.display());
            self.send(RenderMessage::LoopChunk(None));
            self.mark_eof();
        } else {
            let chunk = Chunk::shared(&self.scratch[..n]);
            self.loop_chunk_samples = chunk.len();
            self.send(RenderMessage::LoopChunk(Some(chunk.clone())));
            self.send_chunk(chunk);
        }

        info!(
            "Opened {} ({:.2}s, {} Hz, {} ch)",
            path.display(),
            info.duration,
            info.sample_rate,
            info.channels
        );
        Ok(info)
    }

    /// Decode up to `max_burst` chunks while the queue is below `target_chunks`.
    ///
    /// Returns the number of chunks sent.
    pub fn fill_queue(&mut self, target_chunks: usize, max_burst: usize) -> usize {
        self.flush_backlog();
        if self.decoder.is_none() {
            return 0;
        }

        let mut sent = 0;
        while sent < max_burst && self.queue_estimate < target_chunks && !self.eof {
            if !self.decode_one() {
                break;
            }
            sent += 1;
        }

        if sent > 0 {
            trace!("Queued {} chunks, estimate {}", sent, self.queue_estimate);
        }
        sent
    }

    /// One top-up step toward the configured prebuffer depth.
    pub fn feed(&mut self) -> usize {
        self.fill_queue(self.config.prebuffer_chunks, self.config.max_burst)
    }

    /// Seek the stream and reprime the render side with one chunk.
    ///
    /// Returns the absolute frame the render side now starts from. A rejected
    /// seek leaves everything as it was.
    pub fn seek(&mut self, seconds: f64) -> Result<u64> {
        let decoder = self.decoder.as_mut().ok_or(Error::NotOpen)?;
        decoder.seek(seconds).map_err(|e| match e {
            Error::Seek(_) | Error::NotOpen => e,
            other => Error::Seek(other.to_string()),
        })?;

        let frames = (seconds * f64::from(self.sample_rate)) as u64;
        self.begin_epoch();
        self.send(RenderMessage::SetPosition(frames));
        self.decode_one();

        debug!("Seeked to {:.3}s (frame {})", seconds, frames);
        Ok(frames)
    }

    /// Enable or disable looping at the next splice point.
    pub fn set_loop(&mut self, enabled: bool) {
        self.looping = enabled;
        self.send(RenderMessage::SetLoop(enabled));
    }

    /// Start or stop the render side consuming audio.
    pub fn set_active(&mut self, active: bool) {
        self.send(RenderMessage::SetActive(active));
    }

    /// Close the decoder and empty the render side.
    pub fn close(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
            self.begin_epoch();
            self.send(RenderMessage::ResetPosition);
            self.send(RenderMessage::LoopChunk(None));
            self.loop_chunk_samples = 0;
            debug!("Stream closed");
        }
        self.info = None;
    }

    /// Apply every pending render event.
    pub fn process_events(&mut self, reconciler: &mut PositionReconciler, now: f64) -> EventSummary {
        let mut summary = EventSummary::default();

        while let Some(event) = self.link.try_recv() {
            match event {
                ConsumerEvent::Telemetry(report) if report.epoch == self.epoch => {
                    let in_flight = self.chunks_sent.saturating_sub(report.chunks_received);
                    self.queue_estimate = report.queue_depth + in_flight as usize;
                    reconciler.record(report.frames_played, report.queue_depth, now);

                    if report.underrun_frames > self.reported_underruns {
                        summary.underrun_frames += report.underrun_frames - self.reported_underruns;
                        self.reported_underruns = report.underrun_frames;
                    }
                }
                ConsumerEvent::LoopStarted { epoch } if epoch == self.epoch => {
                    reconciler.reset(0);
                    self.restart_loop();
                    summary.loop_restarts += 1;
                }
                ConsumerEvent::Ended { epoch } if epoch == self.epoch => {
                    summary.ended = true;
                }
                ConsumerEvent::Spent(chunk) => drop(chunk),
                stale => trace!("Ignoring event from an earlier epoch: {stale:?}"),
            }
        }

        if summary.underrun_frames > 0 {
            warn!(
                "Render underrun: {} silent frames (queue estimate {})",
                summary.underrun_frames, self.queue_estimate
            );
        }
        summary
    }

    pub const fn stream_info(&self) -> Option<StreamInfo> {
        self.info
    }

    pub const fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    pub const fn is_eof(&self) -> bool {
        self.eof
    }

    pub const fn is_looping(&self) -> bool {
        self.looping
    }

    /// Chunks believed to be queued on the render side.
    pub const fn queue_estimate(&self) -> usize {
        self.queue_estimate
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn chunk_frames(&self) -> usize {
        self.chunk_samples / CHANNELS
    }

    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Messages waiting for room in the render ring.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Rewind the decoder to just past the loop chunk and refill.
    fn restart_loop(&mut self) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };

        if let Err(e) = decoder.seek(0.0) {
            // The render side ends after the loop chunk instead of stalling.
            error!("Loop restart failed, stopping at end of loop chunk: {e}");
            self.looping = false;
            self.send(RenderMessage::SetLoop(false));
            self.mark_eof();
            return;
        }

        let mut remaining = self.loop_chunk_samples;
        while remaining > 0 {
            let want = remaining.min(self.scratch.len());
            match decoder.read(&mut self.scratch[..want]) {
                Ok(0) => break,
                Ok(n) => remaining -= n,
                Err(e) => {
                    error!("Decode error while skipping loop chunk: {e}");
                    break;
                }
            }
        }

        self.eof = false;
        self.queue_estimate = 0;
        let sent = self.fill_queue(self.config.prebuffer_chunks, self.config.max_burst);
        debug!("Loop restarted, {} chunks queued behind loop chunk", sent);
    }

    /// Read one chunk's worth of samples into the scratch buffer.
    fn read_chunk(&mut self) -> usize {
        let Some(decoder) = self.decoder.as_mut() else {
            return 0;
        };
        match decoder.read(&mut self.scratch[..self.chunk_samples]) {
            Ok(n) => n,
            Err(e) => {
                error!("Decode error, treating as end of stream: {e}");
                0
            }
        }
    }

    /// Decode and send one chunk. Returns false at end of stream.
    fn decode_one(&mut self) -> bool {
        let n = self.read_chunk();
        if n == 0 {
            self.mark_eof();
            return false;
        }
        let chunk = Chunk::shared(&self.scratch[..n]);
        self.send_chunk(chunk);
        true
    }

    fn mark_eof(&mut self) {
        if !self.eof {
            self.eof = true;
            debug!("End of stream reached after {} chunks", self.chunks_sent);
            self.send(RenderMessage::Eof);
        }
    }

    fn send_chunk(&mut self, chunk: SharedChunk) {
        self.send(RenderMessage::Chunk(chunk));
        self.chunks_sent += 1;
        self.queue_estimate += 1;
    }

    /// Start a new epoch: the render side drops everything queued.
    ///
    /// Held messages that outlive a clear stay in the backlog, in order.
    fn begin_epoch(&mut self) {
        self.epoch += 1;
        self.backlog.retain(|message| !message.is_epoch_scoped());
        self.eof = false;
        self.queue_estimate = 0;
        self.chunks_sent = 0;
        self.reported_underruns = 0;
        self.send(RenderMessage::Clear { epoch: self.epoch });
    }

    fn send(&mut self, message: RenderMessage) {
        self.flush_backlog();
        if !self.backlog.is_empty() {
            self.backlog.push_back(message);
            return;
        }
        if let Err(message) = self.link.send(message) {
            debug!("Render ring full, holding message");
            self.backlog.push_back(message);
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(message) = self.backlog.pop_front() {
            if let Err(message) = self.link.send(message) {
                self.backlog.push_front(message);
                break;
            }
        }
    }
}

impl Drop for DecodeBufferManager {
    fn drop(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{RenderConsumer, RenderState};
    use crate::memory::MemoryDecoder;
    use crate::protocol::render_channel;
    use std::time::Duration;

    const RATE: u32 = 1000;

    fn config() -> EngineConfig {
        EngineConfig {
            prebuffer_chunks: 4,
            max_burst: 2,
            ..EngineConfig::default()
        }
    }

    /// Stream of `frames` frames whose left sample is the frame index.
    fn indexed(frames: usize) -> Vec<f32> {
        (0..frames).flat_map(|i| [i as f32, 0.0]).collect()
    }

    fn setup(frames: usize) -> (DecodeBufferManager, RenderConsumer) {
        let config = config();
        let (link, endpoint) = render_channel(&config);
        let consumer = RenderConsumer::new(endpoint, &config, RATE);
        let manager =
            DecodeBufferManager::new(MemoryDecoder::factory(indexed(frames), RATE), link, config, RATE);
        (manager, consumer)
    }

    fn render(consumer: &mut RenderConsumer, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * CHANNELS];
        consumer.render(&mut out);
        out.into_iter().step_by(CHANNELS).collect()
    }

    #[test]
    fn test_open_primes_loop_chunk_and_first_chunk() {
        let (mut manager, mut consumer) = setup(1000);
        let info = manager.open(Path::new("tone")).unwrap();
        assert!((info.duration - 1.0).abs() < f64::EPSILON);
        assert_eq!(manager.chunk_frames(), 100);
        assert_eq!(manager.queue_estimate(), 1);

        render(&mut consumer, 0);
        assert_eq!(consumer.queue_depth(), 1);
        assert_eq!(consumer.loop_chunk_frames(), Some(100));
    }

    #[test]
    fn test_fill_queue_respects_burst_and_target() {
        let (mut manager, _consumer) = setup(10_000);
        manager.open(Path::new("tone")).unwrap();

        assert_eq!(manager.fill_queue(4, 2), 2);
        assert_eq!(manager.queue_estimate(), 3);
        assert_eq!(manager.fill_queue(4, 2), 1);
        assert_eq!(manager.fill_queue(4, 2), 0);
    }

    #[test]
    fn test_short_stream_sends_single_eof() {
        let (mut manager, _consumer) = setup(250);
        manager.open(Path::new("tone")).unwrap();

        assert_eq!(manager.fill_queue(10, 10), 2);
        assert!(manager.is_eof());
        assert_eq!(manager.fill_queue(10, 10), 0);
    }

    #[test]
    fn test_sample_rate_mismatch_rejected() {
        let config = config();
        let (link, _endpoint) = render_channel(&config);
        let mut manager = DecodeBufferManager::new(
            MemoryDecoder::factory(indexed(100), 48000),
            link,
            config,
            44100,
        );
        let result = manager.open(Path::new("tone"));
        assert!(matches!(
            result,
            Err(Error::SampleRateMismatch {
                native: 48000,
                required: 44100
            })
        ));
        assert!(!manager.is_open());
        assert_eq!(manager.epoch(), 0);
    }

    #[test]
    fn test_failed_seek_keeps_state() {
        let (mut manager, _consumer) = setup(1000);
        manager.open(Path::new("tone")).unwrap();
        let epoch = manager.epoch();

        assert!(matches!(manager.seek(5.0), Err(Error::Seek(_))));
        assert_eq!(manager.epoch(), epoch);
        assert_eq!(manager.queue_estimate(), 1);
    }

    #[test]
    fn test_seek_without_stream() {
        let (mut manager, _consumer) = setup(1000);
        assert!(matches!(manager.seek(0.0), Err(Error::NotOpen)));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_loop_restart_resumes_after_loop_chunk() {
        let (mut manager, mut consumer) = setup(250);
        let mut reconciler = PositionReconciler::new(RATE, Duration::from_millis(200));
        manager.open(Path::new("tone")).unwrap();
        manager.set_loop(true);
        manager.set_active(true);
        manager.fill_queue(10, 10);

        let first_pass = render(&mut consumer, 250);
        assert_eq!(first_pass[249], 249.0);

        // Splice into the loop chunk, then let the manager refill.
        let spliced = render(&mut consumer, 1);
        assert_eq!(spliced[0], 0.0);
        let summary = manager.process_events(&mut reconciler, 0.0);
        assert_eq!(summary.loop_restarts, 1);
        assert_eq!(manager.queue_estimate(), 2);
        manager.feed();
        assert!(manager.is_eof());

        let second_pass = render(&mut consumer, 249);
        assert_eq!(second_pass[98], 99.0);
        assert_eq!(second_pass[99], 100.0);
        assert_eq!(second_pass[248], 249.0);
        assert_eq!(consumer.frames_played(), 250);
    }

    #[test]
    fn test_telemetry_updates_estimate() {
        let (mut manager, mut consumer) = setup(10_000);
        let mut reconciler = PositionReconciler::new(RATE, Duration::from_millis(200));
        manager.open(Path::new("tone")).unwrap();
        manager.set_active(true);
        manager.fill_queue(4, 4);
        assert_eq!(manager.queue_estimate(), 4);

        // One report after 100 frames, three chunks still behind the first.
        render(&mut consumer, 100);
        manager.process_events(&mut reconciler, 1.0);
        assert_eq!(manager.queue_estimate(), 3);
        assert_eq!(reconciler.reported_frames(), 100);
    }

    #[test]
    fn test_backlog_when_ring_full() {
        let config = EngineConfig {
            prebuffer_chunks: 1,
            max_burst: 1,
            message_capacity: 16,
            ..EngineConfig::default()
        };
        let (link, _endpoint) = render_channel(&config);
        let mut manager = DecodeBufferManager::new(
            MemoryDecoder::factory(indexed(100_000), RATE),
            link,
            config,
            RATE,
        );
        manager.open(Path::new("tone")).unwrap();
        for _ in 0..20 {
            manager.set_loop(true);
        }
        assert_eq!(manager.backlog_len(), 8);

        // Loop flags survive the new epoch; the clear and the primed chunk queue behind them.
        manager.seek(1.0).unwrap();
        assert_eq!(manager.epoch(), 2);
        assert_eq!(manager.backlog_len(), 11);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_held_state_messages_survive_seek() {
        let config = EngineConfig {
            message_capacity: 16,
            ..config()
        };
        let (link, endpoint) = render_channel(&config);
        let mut consumer = RenderConsumer::new(endpoint, &config, RATE);
        let mut manager = DecodeBufferManager::new(
            MemoryDecoder::factory(indexed(2000), RATE),
            link,
            config,
            RATE,
        );
        manager.open(Path::new("tone")).unwrap();
        for _ in 0..20 {
            manager.set_loop(true);
        }
        manager.set_loop(false);
        manager.set_active(true);
        assert!(manager.backlog_len() > 0);

        manager.seek(1.0).unwrap();
        while manager.backlog_len() > 0 {
            render(&mut consumer, 0);
            manager.fill_queue(0, 0);
        }
        render(&mut consumer, 0);

        assert!(!manager.is_looping());
        assert!(!consumer.is_looping());
        assert!(consumer.is_active());
        assert_eq!(consumer.frames_played(), 1000);
        assert_eq!(consumer.queue_depth(), 1);

        let next = render(&mut consumer, 1);
        assert_eq!(next[0], 1000.0);
    }

    #[test]
    fn test_empty_reopen_drops_previous_loop_chunk() {
        let config = config();
        let (link, endpoint) = render_channel(&config);
        let mut consumer = RenderConsumer::new(endpoint, &config, RATE);
        let opened = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = opened.clone();
        let factory: DecoderFactory = Box::new(move || {
            let frames = if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                300
            } else {
                0
            };
            Box::new(MemoryDecoder::new(indexed(frames), RATE))
        });
        let mut manager = DecodeBufferManager::new(factory, link, config, RATE);
        let mut reconciler = PositionReconciler::new(RATE, Duration::from_millis(200));

        manager.open(Path::new("tone")).unwrap();
        manager.set_loop(true);
        manager.set_active(true);
        manager.feed();
        render(&mut consumer, 10);

        manager.open(Path::new("silence")).unwrap();
        assert!(manager.is_eof());
        let out = render(&mut consumer, 5);

        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(consumer.loop_chunk_frames(), None);
        assert_eq!(consumer.state(), RenderState::Starved);
        let summary = manager.process_events(&mut reconciler, 0.0);
        assert!(summary.ended);
        assert_eq!(summary.loop_restarts, 0);
    }

    #[test]
    fn test_close_drops_loop_chunk() {
        let (mut manager, mut consumer) = setup(1000);
        manager.open(Path::new("tone")).unwrap();
        render(&mut consumer, 0);
        assert_eq!(consumer.loop_chunk_frames(), Some(100));

        manager.close();
        render(&mut consumer, 0);
        assert_eq!(consumer.loop_chunk_frames(), None);
        assert_eq!(consumer.queue_depth(), 0);
    }
}

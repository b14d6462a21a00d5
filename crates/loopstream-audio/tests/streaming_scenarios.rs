//! End-to-end scenarios for the streaming engine.
//!
//! Drives the decode buffer manager and the render consumer directly, without
//! an audio device, using in-memory PCM whose left channel carries the frame
//! index so every emitted frame can be traced back to its source.

#![allow(clippy::unwrap_used, clippy::float_cmp)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loopstream_audio::chunk::CHANNELS;
use loopstream_audio::{
    render_channel, DecodeBufferManager, Decoder, DecoderFactory, MemoryDecoder,
    PositionReconciler, RenderConsumer, RenderState,
};
use loopstream_core::{EngineConfig, Error, Result};
use parking_lot::Mutex;

/// Calls observed by a [`RecordingDecoder`].
#[derive(Debug, Default)]
struct Calls {
    seeks: Vec<f64>,
    reads: usize,
    closes: usize,
}

/// Memory decoder that records how the manager drives it.
struct RecordingDecoder {
    inner: MemoryDecoder,
    calls: Arc<Mutex<Calls>>,
}

impl Decoder for RecordingDecoder {
    fn open(&mut self, path: &Path, sample_rate: u32, thread_hint: usize) -> Result<()> {
        self.inner.open(path, sample_rate, thread_hint)
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.calls.lock().seeks.push(seconds);
        self.inner.seek(seconds)
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        self.calls.lock().reads += 1;
        self.inner.read(out)
    }

    fn close(&mut self) {
        self.calls.lock().closes += 1;
        self.inner.close();
    }

    fn duration(&self) -> f64 {
        self.inner.duration()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }
}

fn recording_factory(frames: usize, sample_rate: u32) -> (DecoderFactory, Arc<Mutex<Calls>>) {
    let samples: Arc<[f32]> = indexed(frames).into();
    let calls = Arc::new(Mutex::new(Calls::default()));
    let shared = calls.clone();
    let factory: DecoderFactory = Box::new(move || {
        Box::new(RecordingDecoder {
            inner: MemoryDecoder::new(samples.clone(), sample_rate),
            calls: shared.clone(),
        })
    });
    (factory, calls)
}

/// Interleaved stereo whose left sample is the frame index.
fn indexed(frames: usize) -> Vec<f32> {
    (0..frames).flat_map(|i| [i as f32, 0.0]).collect()
}

struct Harness {
    manager: DecodeBufferManager,
    consumer: RenderConsumer,
    reconciler: PositionReconciler,
}

impl Harness {
    fn new(factory: DecoderFactory, sample_rate: u32) -> Self {
        Self::with_config(factory, sample_rate, EngineConfig::default())
    }

    fn with_config(factory: DecoderFactory, sample_rate: u32, config: EngineConfig) -> Self {
        let (link, endpoint) = render_channel(&config);
        let consumer = RenderConsumer::new(endpoint, &config, sample_rate);
        let reconciler =
            PositionReconciler::new(sample_rate, Duration::from_millis(config.stale_report_ms));
        let manager = DecodeBufferManager::new(factory, link, config, sample_rate);
        Self {
            manager,
            consumer,
            reconciler,
        }
    }

    /// Render `frames` frames and return the left channel.
    fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * CHANNELS];
        self.consumer.render(&mut out);
        out.into_iter().step_by(CHANNELS).collect()
    }

    fn process(&mut self) -> loopstream_audio::EventSummary {
        self.manager.process_events(&mut self.reconciler, 0.0)
    }
}

#[test]
fn loop_chunk_entered_at_third_chunk_boundary() {
    const RATE: u32 = 44_100;
    const CHUNK: usize = 4410;

    let (factory, _calls) = recording_factory(3 * CHUNK, RATE);
    let mut h = Harness::new(factory, RATE);
    h.manager.open(Path::new("three-chunks")).unwrap();
    h.manager.set_loop(true);
    h.manager.set_active(true);
    h.manager.fill_queue(10, 10);
    assert!(h.manager.is_eof());

    let played = h.render(3 * CHUNK);
    assert_eq!(played[3 * CHUNK - 1], (3 * CHUNK - 1) as f32);
    assert_eq!(h.consumer.state(), RenderState::Normal);
    assert_eq!(h.consumer.frames_played(), (3 * CHUNK) as u64);

    let spliced = h.render(1);
    assert_eq!(spliced[0], 0.0);
    assert_eq!(h.consumer.state(), RenderState::PlayingLoopChunk);
    assert_eq!(h.consumer.frames_played(), 1);
    assert_eq!(h.process().loop_restarts, 1);
}

#[test]
fn seek_before_playback_primes_one_chunk() {
    const RATE: u32 = 8000;

    let (factory, calls) = recording_factory(60 * RATE as usize, RATE);
    let mut h = Harness::new(factory, RATE);
    h.manager.open(Path::new("minute")).unwrap();
    h.manager.seek(30.0).unwrap();

    assert_eq!(calls.lock().seeks, vec![30.0]);
    assert_eq!(h.manager.queue_estimate(), 1);

    h.render(0);
    assert_eq!(h.consumer.frames_played(), 30 * u64::from(RATE));
    assert_eq!(h.consumer.queue_depth(), 1);

    h.manager.set_active(true);
    let first = h.render(1);
    assert_eq!(first[0], (30 * RATE) as f32);
}

#[test]
fn zero_read_marks_fourth_chunk_last() {
    const RATE: u32 = 44_100;
    const CHUNK: usize = 4410;

    let (factory, calls) = recording_factory(4 * CHUNK, RATE);
    let mut h = Harness::new(factory, RATE);
    h.manager.open(Path::new("four-chunks")).unwrap();
    h.manager.set_active(true);
    assert_eq!(h.manager.fill_queue(10, 10), 3);
    assert!(h.manager.is_eof());
    assert_eq!(calls.lock().reads, 5);

    // No further pulls once end-of-stream is known.
    assert_eq!(h.manager.fill_queue(10, 10), 0);
    assert_eq!(calls.lock().reads, 5);

    h.render(4 * CHUNK);
    assert!(!h.process().ended);

    h.render(100);
    assert_eq!(h.consumer.state(), RenderState::Starved);
    assert_eq!(h.consumer.underrun_frames(), 0);
    assert_eq!(h.consumer.frames_played(), (4 * CHUNK) as u64);
    assert!(h.process().ended);

    h.render(CHUNK);
    assert!(!h.process().ended);
}

#[test]
fn mismatched_rate_rejected_without_sending() {
    let (factory, calls) = recording_factory(48_000, 48_000);
    let mut h = Harness::new(factory, 44_100);

    let err = h.manager.open(Path::new("hi-res")).unwrap_err();
    assert!(matches!(
        err,
        Error::SampleRateMismatch {
            native: 48_000,
            required: 44_100
        }
    ));
    assert!(err.is_fatal_to_stream());
    assert_eq!(calls.lock().closes, 1);
    assert_eq!(calls.lock().reads, 0);

    h.render(0);
    assert_eq!(h.consumer.queue_depth(), 0);
    assert_eq!(h.consumer.loop_chunk_frames(), None);
}

#[test]
fn failed_open_keeps_current_stream() {
    const RATE: u32 = 1000;

    // The first decoder matches the output rate, every later one does not.
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let samples: Arc<[f32]> = indexed(1000).into();
    let factory: DecoderFactory = Box::new(move || {
        let rate = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            RATE
        } else {
            2 * RATE
        };
        Box::new(MemoryDecoder::new(samples.clone(), rate))
    });
    let mut h = Harness::new(factory, RATE);
    h.manager.open(Path::new("first")).unwrap();
    h.manager.set_active(true);
    h.manager.feed();
    h.render(10);
    let epoch = h.manager.epoch();

    assert!(h.manager.open(Path::new("second")).is_err());
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    assert_eq!(h.manager.epoch(), epoch);

    let next = h.render(1);
    assert_eq!(next[0], 10.0);
    assert!(h.manager.stream_info().is_some());
}

#[test]
fn looping_is_sample_continuous_across_passes() {
    const RATE: u32 = 1000;
    const FRAMES: usize = 350;

    let (factory, calls) = recording_factory(FRAMES, RATE);
    let mut h = Harness::new(factory, RATE);
    h.manager.open(Path::new("loop")).unwrap();
    h.manager.set_loop(true);
    h.manager.set_active(true);

    let mut emitted = Vec::new();
    let mut restarts = 0;
    while emitted.len() < 3 * FRAMES {
        restarts += h.process().loop_restarts;
        h.manager.feed();
        emitted.extend(h.render(37));
    }

    for (i, value) in emitted.iter().take(3 * FRAMES).enumerate() {
        assert_eq!(*value, (i % FRAMES) as f32, "frame {i}");
    }
    assert_eq!(h.consumer.underrun_frames(), 0);
    assert!(restarts >= 2);
    assert!(calls.lock().seeks.iter().all(|s| *s == 0.0));
}

#[test]
fn stale_telemetry_ignored_after_seek() {
    const RATE: u32 = 1000;

    let (factory, _calls) = recording_factory(10 * RATE as usize, RATE);
    let mut h = Harness::new(factory, RATE);
    h.manager.open(Path::new("ten-seconds")).unwrap();
    h.manager.set_active(true);
    h.manager.feed();
    h.render(250);

    let frames = h.manager.seek(5.0).unwrap();
    h.reconciler.reset(frames);
    h.process();

    assert_eq!(h.reconciler.reported_frames(), 5000);
    assert_eq!(h.manager.queue_estimate(), 1);
}

#[test]
fn rejected_seek_leaves_playback_untouched() {
    const RATE: u32 = 1000;

    let samples = indexed(1000);
    let factory: DecoderFactory = Box::new(move || {
        Box::new(MemoryDecoder::new(samples.clone(), RATE).without_seek())
    });
    let mut h = Harness::new(factory, RATE);
    h.manager.open(Path::new("unseekable")).unwrap();
    h.manager.set_active(true);
    h.render(20);

    assert!(matches!(h.manager.seek(0.5), Err(Error::Seek(_))));
    let next = h.render(1);
    assert_eq!(next[0], 20.0);
    assert_eq!(h.consumer.frames_played(), 21);
}

#[test]
fn short_chunks_play_through_without_underrun() {
    const RATE: u32 = 1000;

    // Ten-millisecond chunks need a prebuffer that outlasts one telemetry period.
    let config = EngineConfig {
        chunk_duration_ms: 10,
        prebuffer_chunks: 20,
        max_burst: 4,
        ..EngineConfig::default()
    };
    let (factory, _calls) = recording_factory(500, RATE);
    let mut h = Harness::with_config(factory, RATE, config);
    h.manager.open(Path::new("short-chunks")).unwrap();
    h.manager.set_active(true);

    let mut emitted = Vec::new();
    let mut ended = false;
    for _ in 0..120 {
        ended |= h.process().ended;
        h.manager.feed();
        emitted.extend(h.render(5));
    }

    assert!(ended);
    assert_eq!(h.consumer.underrun_frames(), 0);
    assert_eq!(emitted[499], 499.0);
    assert!(emitted[500..].iter().all(|s| *s == 0.0));
}

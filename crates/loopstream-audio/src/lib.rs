//! # loopstream-audio
//!
//! Gapless, seekable streaming playback.
//!
//! Features:
//! - Lock-free SPSC rings between the control thread and the render callback
//! - Seamless loop splice through a cached first chunk
//! - Drift-free position reporting between throttled render reports
//! - Symphonia streaming decode, with an FFmpeg fallback
//! - Low-latency cpal output

pub mod buffer;
pub mod chunk;
pub mod consumer;
pub mod controller;
pub mod decode;
pub mod engine;
pub mod ffmpeg_decode;
pub mod manager;
pub mod memory;
pub mod output;
pub mod position;
pub mod protocol;

pub use chunk::{Chunk, SharedChunk};
pub use consumer::{RenderConsumer, RenderState};
pub use controller::{EngineEvent, PlaybackController, PlaybackState, PlaybackStatus};
pub use decode::{Decoder, DecoderFactory, SymphoniaDecoder};
pub use engine::{AudioEngine, EngineCommand};
pub use ffmpeg_decode::FfmpegDecoder;
pub use manager::{DecodeBufferManager, EventSummary};
pub use memory::MemoryDecoder;
pub use position::{HostClock, ManualClock, MonotonicClock, PositionReconciler};
pub use protocol::{render_channel, ConsumerEvent, RenderLink, RenderMessage, Telemetry};

//! Render-side state machine.
//!
//! [`RenderConsumer`] lives inside the audio callback. It owns the chunk
//! queue, the cached loop chunk and the frame counter, and decides for every
//! output slot whether to play the current chunk, splice into the loop chunk,
//! or emit silence.
//!
//! Nothing in here allocates, locks, blocks, or logs. The queue storage is
//! reserved up front and spent chunks are handed back to the control thread
//! for release.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::VecDeque;

use loopstream_core::EngineConfig;

use crate::buffer::{QueueConsumer, QueueProducer};
use crate::chunk::{SharedChunk, CHANNELS};
use crate::protocol::{ConsumerEvent, RenderEndpoint, RenderMessage, Telemetry};

/// Event slots kept free for loop and end signals.
const RESERVED_EVENT_SLOTS: usize = 4;

/// What the consumer is currently emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderState {
    /// Draining queued chunks in order.
    #[default]
    Normal,
    /// Replaying the cached loop chunk.
    PlayingLoopChunk,
    /// Nothing to play; emitting silence.
    Starved,
}

/// A queued chunk plus the end-of-stream mark the render side keeps for it.
struct QueuedChunk {
    chunk: SharedChunk,
    is_last: bool,
}

/// Per-sample playback state machine run by the audio callback.
pub struct RenderConsumer {
    messages: QueueConsumer<RenderMessage>,
    events: QueueProducer<ConsumerEvent>,
    queue: VecDeque<QueuedChunk>,
    queue_capacity: usize,
    current: Option<QueuedChunk>,
    /// Next frame to read from `current`.
    read_offset: usize,
    loop_chunk: Option<SharedChunk>,
    /// Next frame to read from `loop_chunk`.
    loop_offset: usize,
    state: RenderState,
    looping: bool,
    active: bool,
    /// End-of-stream arrived when there was no chunk left to mark.
    eof_pending: bool,
    /// The last chunk has drained and no splice happened.
    at_end: bool,
    end_notified: bool,
    frames_played: u64,
    slots_since_report: u64,
    telemetry_interval: u64,
    underrun_frames: u64,
    chunks_received: u64,
    epoch: u64,
    /// Spent chunks waiting for room in the event ring.
    spent: Vec<SharedChunk>,
}

impl RenderConsumer {
    /// Create a consumer for the given output sample rate.
    pub fn new(endpoint: RenderEndpoint, config: &EngineConfig, sample_rate: u32) -> Self {
        let queue_capacity = config.render_queue_capacity();
        // Every chunk the render side can hold at once: the message ring, the
        // queue, the current chunk and the loop chunk.
        let spent_capacity = config.message_capacity.next_power_of_two() + queue_capacity + 2;
        Self {
            messages: endpoint.messages,
            events: endpoint.events,
            queue: VecDeque::with_capacity(queue_capacity),
            queue_capacity,
            current: None,
            read_offset: 0,
            loop_chunk: None,
            loop_offset: 0,
            state: RenderState::Normal,
            looping: false,
            active: false,
            eof_pending: false,
            at_end: false,
            end_notified: false,
            frames_played: 0,
            slots_since_report: 0,
            telemetry_interval: config.telemetry_interval_frames(sample_rate),
            underrun_frames: 0,
            chunks_received: 0,
            epoch: 0,
            spent: Vec::with_capacity(spent_capacity),
        }
    }

    /// Fill `output` with interleaved stereo frames.
    ///
    /// Pending control messages are applied first. Always writes every sample
    /// of `output`.
    pub fn render(&mut self, output: &mut [f32]) {
        self.return_spent();
        self.drain_messages();

        if !self.active {
            output.fill(0.0);
            return;
        }

        for frame in output.chunks_mut(CHANNELS) {
            match self.next_frame() {
                Some(samples) => {
                    for (out, sample) in frame.iter_mut().zip(samples) {
                        *out = sample;
                    }
                    self.frames_played += 1;
                }
                None => frame.fill(0.0),
            }

            self.slots_since_report += 1;
            if self.slots_since_report >= self.telemetry_interval {
                self.slots_since_report = 0;
                self.post_telemetry();
            }
        }
    }

    /// Current state of the machine.
    pub const fn state(&self) -> RenderState {
        self.state
    }

    /// Frames played since the last reset.
    pub const fn frames_played(&self) -> u64 {
        self.frames_played
    }

    /// Chunks waiting behind the current one.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Whether a regular chunk is being played.
    pub const fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// Length of the cached loop chunk in frames.
    pub fn loop_chunk_frames(&self) -> Option<usize> {
        self.loop_chunk.as_ref().map(|chunk| chunk.frames())
    }

    pub const fn is_looping(&self) -> bool {
        self.looping
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    pub const fn underrun_frames(&self) -> u64 {
        self.underrun_frames
    }

    /// Spent chunks waiting for room in the event ring.
    pub fn held_chunks(&self) -> usize {
        self.spent.len()
    }

    fn drain_messages(&mut self) {
        // A full queue leaves the rest in the ring so ordering is kept.
        while self.queue.len() < self.queue_capacity {
            let Some(message) = self.messages.pop() else {
                break;
            };
            self.apply(message);
        }
    }

    fn apply(&mut self, message: RenderMessage) {
        match message {
            RenderMessage::Chunk(chunk) => {
                self.chunks_received += 1;
                self.queue.push_back(QueuedChunk {
                    chunk,
                    is_last: false,
                });
            }
            RenderMessage::Eof => {
                if let Some(tail) = self.queue.back_mut() {
                    tail.is_last = true;
                } else if let Some(current) = self.current.as_mut() {
                    current.is_last = true;
                } else {
                    self.eof_pending = true;
                }
            }
            RenderMessage::LoopChunk(chunk) => {
                if let Some(old) = std::mem::replace(&mut self.loop_chunk, chunk) {
                    self.retire(old);
                }
                if self.state == RenderState::PlayingLoopChunk {
                    self.state = RenderState::Normal;
                }
                self.loop_offset = 0;
            }
            RenderMessage::SetLoop(enabled) => self.looping = enabled,
            RenderMessage::Clear { epoch } => self.clear(epoch),
            RenderMessage::ResetPosition => self.frames_played = 0,
            RenderMessage::SetPosition(frames) => self.frames_played = frames,
            RenderMessage::SetActive(active) => {
                // Report the exact stop position so a paused clock is precise.
                if self.active && !active {
                    self.post_telemetry();
                }
                self.active = active;
            }
        }
    }

    fn clear(&mut self, epoch: u64) {
        while let Some(queued) = self.queue.pop_front() {
            self.retire(queued.chunk);
        }
        if let Some(current) = self.current.take() {
            self.retire(current.chunk);
        }
        self.read_offset = 0;
        self.loop_offset = 0;
        self.state = RenderState::Normal;
        self.eof_pending = false;
        self.at_end = false;
        self.end_notified = false;
        self.underrun_frames = 0;
        self.chunks_received = 0;
        self.epoch = epoch;
    }

    fn next_frame(&mut self) -> Option<[f32; CHANNELS]> {
        if self.state == RenderState::PlayingLoopChunk {
            if let Some(frame) = self
                .loop_chunk
                .as_ref()
                .and_then(|chunk| chunk.frame(self.loop_offset))
            {
                self.loop_offset += 1;
                return Some(frame);
            }
            self.state = RenderState::Normal;
            self.loop_offset = 0;
            let finished_last = std::mem::take(&mut self.eof_pending);
            return self.cross_boundary(finished_last);
        }

        if let Some(current) = &self.current {
            if let Some(frame) = current.chunk.frame(self.read_offset) {
                self.read_offset += 1;
                return Some(frame);
            }
        }

        let finished_last = match self.current.take() {
            Some(done) => {
                let is_last = done.is_last;
                self.retire(done.chunk);
                is_last
            }
            None => false,
        };
        let finished_last = finished_last || std::mem::take(&mut self.eof_pending);
        self.cross_boundary(finished_last)
    }

    /// Decide what follows an exhausted or absent chunk.
    fn cross_boundary(&mut self, mut finished_last: bool) -> Option<[f32; CHANNELS]> {
        loop {
            if finished_last {
                if self.looping {
                    if let Some(frame) = self.start_loop_chunk() {
                        return Some(frame);
                    }
                }
                self.at_end = true;
            }

            match self.queue.pop_front() {
                Some(next) => {
                    if let Some(frame) = next.chunk.frame(0) {
                        self.current = Some(next);
                        self.read_offset = 1;
                        self.state = RenderState::Normal;
                        self.at_end = false;
                        return Some(frame);
                    }
                    finished_last = next.is_last;
                    self.retire(next.chunk);
                }
                None => {
                    self.state = RenderState::Starved;
                    if self.at_end {
                        self.notify_end();
                    } else {
                        self.underrun_frames += 1;
                    }
                    return None;
                }
            }
        }
    }

    fn start_loop_chunk(&mut self) -> Option<[f32; CHANNELS]> {
        let frame = self.loop_chunk.as_ref()?.frame(0)?;
        self.state = RenderState::PlayingLoopChunk;
        self.loop_offset = 1;
        self.frames_played = 0;
        self.at_end = false;
        self.post_signal(ConsumerEvent::LoopStarted { epoch: self.epoch });
        Some(frame)
    }

    fn notify_end(&mut self) {
        if !self.end_notified {
            self.end_notified = true;
            self.post_signal(ConsumerEvent::Ended { epoch: self.epoch });
        }
    }

    fn post_telemetry(&mut self) {
        if self.events.free() > RESERVED_EVENT_SLOTS {
            let _ = self.events.push(ConsumerEvent::Telemetry(Telemetry {
                epoch: self.epoch,
                frames_played: self.frames_played,
                queue_depth: self.queue.len(),
                chunks_received: self.chunks_received,
                underrun_frames: self.underrun_frames,
            }));
        }
    }

    fn post_signal(&mut self, event: ConsumerEvent) {
        let _ = self.events.push(event);
    }

    /// Hand a chunk back to the control thread so it is freed there.
    ///
    /// With the event ring busy the chunk waits in a preallocated holding area.
    fn retire(&mut self, chunk: SharedChunk) {
        if self.spent.is_empty() && self.events.free() > RESERVED_EVENT_SLOTS {
            let _ = self.events.push(ConsumerEvent::Spent(chunk));
        } else if self.spent.len() < self.spent.capacity() {
            self.spent.push(chunk);
        }
        // Only a stalled control thread with more chunks in flight than the
        // holding area fits gets here; the chunk is released in place.
    }

    /// Move held chunks into the event ring while there is room.
    fn return_spent(&mut self) {
        let room = self.events.free().saturating_sub(RESERVED_EVENT_SLOTS);
        let count = room.min(self.spent.len());
        for chunk in self.spent.drain(..count) {
            let _ = self.events.push(ConsumerEvent::Spent(chunk));
        }
    }
}

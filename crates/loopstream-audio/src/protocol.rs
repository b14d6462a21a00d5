//! Messages exchanged between the control thread and the render callback.
//!
//! Each direction is a bounded [`spsc_queue`]. Control signals travel in the
//! same ring as chunks so the render side applies them in send order.

use loopstream_core::EngineConfig;

use crate::buffer::{spsc_queue, QueueConsumer, QueueProducer};
use crate::chunk::SharedChunk;

/// Control to render messages.
#[derive(Debug, Clone)]
pub enum RenderMessage {
    /// Append a chunk to the playback queue.
    Chunk(SharedChunk),
    /// No chunk follows the most recently sent one.
    Eof,
    /// Replace the cached loop chunk. `None` drops it.
    LoopChunk(Option<SharedChunk>),
    /// Enable or disable looping at the next splice point.
    SetLoop(bool),
    /// Drop all queued audio and start a new epoch.
    Clear { epoch: u64 },
    /// Set the frame counter to zero.
    ResetPosition,
    /// Set the frame counter to an absolute value.
    SetPosition(u64),
    /// Start or stop consuming audio. Inactive output is silent.
    SetActive(bool),
}

impl RenderMessage {
    /// Whether the message only makes sense within the epoch it was sent in.
    ///
    /// Loop, activity and loop chunk messages carry state that outlives a
    /// clear.
    pub const fn is_epoch_scoped(&self) -> bool {
        matches!(
            self,
            Self::Chunk(_)
                | Self::Eof
                | Self::Clear { .. }
                | Self::ResetPosition
                | Self::SetPosition(_)
        )
    }
}

/// Periodic status report from the render side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// Epoch the report was produced under.
    pub epoch: u64,
    /// Frames played since the last reset.
    pub frames_played: u64,
    /// Chunks waiting in the render queue.
    pub queue_depth: usize,
    /// Chunks received during this epoch.
    pub chunks_received: u64,
    /// Slots rendered as silence because no chunk was available.
    pub underrun_frames: u64,
}

/// Render to control events.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Telemetry(Telemetry),
    /// The render side spliced into the loop chunk and reset its frame counter.
    LoopStarted { epoch: u64 },
    /// The last chunk finished playing and looping was off.
    Ended { epoch: u64 },
    /// A chunk the render side no longer needs, handed back for release.
    Spent(SharedChunk),
}

/// Control side of the render channel.
pub struct RenderLink {
    messages: QueueProducer<RenderMessage>,
    events: QueueConsumer<ConsumerEvent>,
}

impl RenderLink {
    /// Send a message, handing it back if the ring is full.
    pub fn send(&mut self, message: RenderMessage) -> Result<(), RenderMessage> {
        self.messages.push(message)
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<ConsumerEvent> {
        self.events.pop()
    }

    /// Messages sent but not yet picked up by the render side.
    pub fn in_flight(&self) -> usize {
        self.messages.len()
    }
}

/// Render side of the render channel.
pub struct RenderEndpoint {
    pub(crate) messages: QueueConsumer<RenderMessage>,
    pub(crate) events: QueueProducer<ConsumerEvent>,
}

/// Create both ends of the render channel sized from the configuration.
pub fn render_channel(config: &EngineConfig) -> (RenderLink, RenderEndpoint) {
    let (message_tx, message_rx) = spsc_queue(config.message_capacity);
    let (event_tx, event_rx) = spsc_queue(config.event_capacity);
    (
        RenderLink {
            messages: message_tx,
            events: event_rx,
        },
        RenderEndpoint {
            messages: message_rx,
            events: event_tx,
        },
    )
}

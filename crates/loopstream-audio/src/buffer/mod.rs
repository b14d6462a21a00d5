//! Lock-free buffer implementations for real-time audio.

pub mod ring;

pub use ring::{spsc_queue, QueueConsumer, QueueProducer, SpscQueue};

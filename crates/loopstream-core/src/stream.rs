//! Stream metadata reported when a stream is opened.

use serde::{Deserialize, Serialize};

/// Metadata describing an open stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    /// Total duration in seconds (0.0 if unknown).
    pub duration: f64,
    /// Sample rate in Hz. Always equal to the output rate.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl StreamInfo {
    pub const fn new(duration: f64, sample_rate: u32, channels: u16) -> Self {
        Self {
            duration,
            sample_rate,
            channels,
        }
    }

    /// Total length in frames, rounded down.
    pub fn total_frames(&self) -> u64 {
        if self.duration.is_finite() && self.duration > 0.0 {
            (self.duration * f64::from(self.sample_rate)) as u64
        } else {
            0
        }
    }
}

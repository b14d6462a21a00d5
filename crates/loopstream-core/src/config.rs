//! Engine configuration.
//!
//! Chunk duration and prebuffer depth trade latency against underrun risk:
//! longer chunks and deeper prebuffers survive slower decode bursts, while
//! shorter ones reduce memory use and make seeks and loop restarts cheaper.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Control messages that may sit in the render ring alongside a full prebuffer.
const SIGNAL_HEADROOM: usize = 8;

/// Tunables for the streaming engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Length of one decoded chunk in milliseconds.
    pub chunk_duration_ms: u32,
    /// Target number of chunks queued ahead of the render callback.
    pub prebuffer_chunks: usize,
    /// Maximum chunks decoded by a single top-up invocation.
    pub max_burst: usize,
    /// Interval between top-up invocations in milliseconds.
    pub feed_interval_ms: u64,
    /// Telemetry is posted every `sample_rate / telemetry_divisor` frames.
    pub telemetry_divisor: u32,
    /// Reports older than this are never extrapolated.
    pub stale_report_ms: u64,
    /// Capacity of the control to render message ring.
    pub message_capacity: usize,
    /// Capacity of the render to control event ring.
    pub event_capacity: usize,
    /// Forced output sample rate. `None` uses the device default.
    pub output_sample_rate: Option<u32>,
    /// Thread hint passed to the decoder (0 lets the decoder choose).
    pub decoder_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: 100,
            prebuffer_chunks: 10,
            max_burst: 3,
            feed_interval_ms: 20,
            telemetry_divisor: 10,
            stale_report_ms: 200,
            message_capacity: 64,
            event_capacity: 256,
            output_sample_rate: None,
            decoder_threads: 0,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every tunable is usable.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_duration_ms == 0 {
            return Err(Error::Configuration(
                "chunk_duration_ms must be positive".to_string(),
            ));
        }
        if self.prebuffer_chunks == 0 {
            return Err(Error::Configuration(
                "prebuffer_chunks must be positive".to_string(),
            ));
        }
        if self.max_burst == 0 {
            return Err(Error::Configuration("max_burst must be positive".to_string()));
        }
        if self.feed_interval_ms == 0 {
            return Err(Error::Configuration(
                "feed_interval_ms must be positive".to_string(),
            ));
        }
        if self.telemetry_divisor == 0 {
            return Err(Error::Configuration(
                "telemetry_divisor must be positive".to_string(),
            ));
        }
        if self.message_capacity < self.render_queue_capacity() + SIGNAL_HEADROOM {
            return Err(Error::Configuration(format!(
                "message_capacity {} cannot hold {} chunks plus control signals",
                self.message_capacity,
                self.render_queue_capacity()
            )));
        }
        if self.event_capacity < SIGNAL_HEADROOM * 2 {
            return Err(Error::Configuration(format!(
                "event_capacity must be at least {}",
                SIGNAL_HEADROOM * 2
            )));
        }
        if self.output_sample_rate == Some(0) {
            return Err(Error::Configuration(
                "output_sample_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Frames per chunk at the given sample rate (at least one).
    pub fn chunk_frames(&self, sample_rate: u32) -> usize {
        let frames = u64::from(sample_rate) * u64::from(self.chunk_duration_ms) / 1000;
        (frames as usize).max(1)
    }

    /// Frames between two telemetry reports at the given sample rate.
    pub fn telemetry_interval_frames(&self, sample_rate: u32) -> u64 {
        u64::from((sample_rate / self.telemetry_divisor.max(1)).max(1))
    }

    /// Number of chunks the render side can hold at once.
    pub const fn render_queue_capacity(&self) -> usize {
        self.prebuffer_chunks + self.max_burst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_frames(44100), 4410);
        assert_eq!(config.telemetry_interval_frames(44100), 4410);
    }

    #[test]
    fn test_rejects_zero_prebuffer() {
        let config = EngineConfig {
            prebuffer_chunks: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_undersized_message_ring() {
        let config = EngineConfig {
            prebuffer_chunks: 60,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "prebuffer_chunks": 4, "output_sample_rate": 48000 }"#)
                .unwrap();
        assert_eq!(config.prebuffer_chunks, 4);
        assert_eq!(config.output_sample_rate, Some(48000));
        assert_eq!(config.chunk_duration_ms, 100);
    }

    proptest! {
        #[test]
        fn prop_derived_sizes_are_positive(
            rate in 0u32..400_000,
            chunk_ms in 1u32..5_000,
            divisor in 1u32..1_000,
        ) {
            let config = EngineConfig {
                chunk_duration_ms: chunk_ms,
                telemetry_divisor: divisor,
                ..EngineConfig::default()
            };
            prop_assert!(config.chunk_frames(rate) >= 1);
            prop_assert!(config.telemetry_interval_frames(rate) >= 1);
        }

        #[test]
        fn prop_validated_ring_fits_queue(prebuffer in 1usize..64, burst in 1usize..16) {
            let config = EngineConfig {
                prebuffer_chunks: prebuffer,
                max_burst: burst,
                ..EngineConfig::default()
            };
            if config.validate().is_ok() {
                prop_assert!(config.message_capacity > config.render_queue_capacity());
            }
        }
    }

    #[test]
    fn test_tiny_chunk_is_at_least_one_frame() {
        let config = EngineConfig {
            chunk_duration_ms: 1,
            ..EngineConfig::default()
        };
        assert_eq!(config.chunk_frames(100), 1);
    }
}

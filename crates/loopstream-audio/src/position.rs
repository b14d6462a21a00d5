//! Drift-free playback position for polling callers.
//!
//! The render side reports its frame counter only every ~100 ms. Between
//! reports the position is extrapolated from the host clock, but only while
//! the report is fresh and audio is actually flowing.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Continuous clock the position is extrapolated against, in seconds.
pub trait HostClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Host clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Host clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, seconds: f64) {
        *self.now.lock() = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// Combines render reports with the host clock.
#[derive(Debug, Clone)]
pub struct PositionReconciler {
    sample_rate: u32,
    stale_after: f64,
    reported_frames: u64,
    /// Host time the last report was received; `None` after a reset.
    received_at: Option<f64>,
    queue_depth: usize,
    active: bool,
}

impl PositionReconciler {
    pub fn new(sample_rate: u32, stale_after: Duration) -> Self {
        Self {
            sample_rate,
            stale_after: stale_after.as_secs_f64(),
            reported_frames: 0,
            received_at: None,
            queue_depth: 0,
            active: false,
        }
    }

    /// Record a telemetry report received at host time `now`.
    pub fn record(&mut self, frames: u64, queue_depth: usize, now: f64) {
        self.reported_frames = frames;
        self.queue_depth = queue_depth;
        self.received_at = Some(now);
    }

    /// Jump to a known position. No extrapolation until the next report.
    pub fn reset(&mut self, frames: u64) {
        self.reported_frames = frames;
        self.queue_depth = 0;
        self.received_at = None;
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    pub const fn reported_frames(&self) -> u64 {
        self.reported_frames
    }

    /// Position in frames at host time `now`.
    pub fn position_frames(&self, now: f64) -> u64 {
        let Some(received_at) = self.received_at else {
            return self.reported_frames;
        };
        if !self.active || self.queue_depth == 0 || !now.is_finite() || !received_at.is_finite()
        {
            return self.reported_frames;
        }

        let age = now - received_at;
        if !(0.0..self.stale_after).contains(&age) {
            return self.reported_frames;
        }

        let extra = (age * f64::from(self.sample_rate)).floor() as u64;
        self.reported_frames + extra
    }

    /// Position in seconds at host time `now`.
    pub fn current_time(&self, now: f64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.position_frames(now) as f64 / f64::from(self.sample_rate)
    }
}

//! Control-domain playback controller.
//!
//! [`PlaybackController`] wraps the [`DecodeBufferManager`] with the
//! play/pause/seek/loop surface, tracks [`PlaybackState`] and publishes
//! [`EngineEvent`]s. It has no audio device of its own, so the threaded
//! engine and the tests drive it the same way.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use loopstream_core::{Error, Result, StreamInfo};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::manager::DecodeBufferManager;
use crate::position::{HostClock, PositionReconciler};

/// Callback fired once per natural end of stream.
pub type EndedCallback = Box<dyn FnMut() + Send>;

/// Playback state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Playback state changed.
    StateChanged(PlaybackState),
    /// A stream was opened and primed.
    StreamOpened(StreamInfo),
    /// Playback wrapped around to the start of the stream.
    LoopRestarted,
    /// Playback reached the end of the stream with looping off.
    Ended,
    /// The render side emitted this many silent frames for lack of data.
    Underrun(u64),
    /// Error occurred.
    Error(String),
}

/// Playback status readable from any thread.
#[derive(Clone)]
pub struct PlaybackStatus {
    state: Arc<RwLock<PlaybackState>>,
    stream: Arc<RwLock<Option<StreamInfo>>>,
    reconciler: Arc<Mutex<PositionReconciler>>,
    clock: Arc<dyn HostClock>,
    on_ended: Arc<Mutex<Option<EndedCallback>>>,
}

impl PlaybackStatus {
    pub fn new(sample_rate: u32, stale_after: Duration, clock: Arc<dyn HostClock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(PlaybackState::Stopped)),
            stream: Arc::new(RwLock::new(None)),
            reconciler: Arc::new(Mutex::new(PositionReconciler::new(sample_rate, stale_after))),
            clock,
            on_ended: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.read()
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        *self.stream.read()
    }

    /// Duration of the open stream in seconds, 0.0 when nothing is open.
    pub fn duration(&self) -> f64 {
        self.stream_info().map_or(0.0, |info| info.duration)
    }

    /// Playback position in seconds.
    pub fn current_time(&self) -> f64 {
        let now = self.clock.now();
        self.reconciler.lock().current_time(now)
    }

    /// Register the end-of-stream callback, replacing any previous one.
    pub fn set_on_ended(&self, callback: EndedCallback) {
        *self.on_ended.lock() = Some(callback);
    }

    fn fire_ended(&self) {
        // Run the callback unlocked so it may register a replacement.
        let taken = self.on_ended.lock().take();
        if let Some(mut callback) = taken {
            callback();
            let mut slot = self.on_ended.lock();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

/// Drives a [`DecodeBufferManager`] on behalf of a caller.
pub struct PlaybackController {
    manager: DecodeBufferManager,
    status: PlaybackStatus,
    events: Sender<EngineEvent>,
    /// Natural end reached; the next play starts over.
    finished: bool,
}

impl PlaybackController {
    pub fn new(manager: DecodeBufferManager, status: PlaybackStatus, events: Sender<EngineEvent>) -> Self {
        Self {
            manager,
            status,
            events,
            finished: false,
        }
    }

    pub const fn status(&self) -> &PlaybackStatus {
        &self.status
    }

    pub const fn manager(&self) -> &DecodeBufferManager {
        &self.manager
    }

    /// Open a stream. A playing engine keeps playing the new stream.
    pub fn open(&mut self, path: &Path) -> Result<StreamInfo> {
        let info = match self.manager.open(path) {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to open {}: {e}", path.display());
                self.emit(EngineEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        {
            let mut reconciler = self.status.reconciler.lock();
            reconciler.set_sample_rate(info.sample_rate);
            reconciler.reset(0);
        }
        *self.status.stream.write() = Some(info);
        self.finished = false;
        self.emit(EngineEvent::StreamOpened(info));
        Ok(info)
    }

    pub fn play(&mut self) -> Result<()> {
        if !self.manager.is_open() {
            warn!("Cannot play: no stream open");
            self.emit(EngineEvent::Error("No stream open".to_string()));
            return Err(Error::NotOpen);
        }
        if self.finished {
            self.rewind();
        }

        self.manager.set_active(true);
        self.status.reconciler.lock().set_active(true);
        self.manager.feed();
        self.set_state(PlaybackState::Playing);
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state() != PlaybackState::Playing {
            return;
        }
        self.manager.set_active(false);
        self.status.reconciler.lock().set_active(false);
        self.set_state(PlaybackState::Paused);
    }

    /// Seek to `seconds`. A rejected seek leaves the position unchanged.
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let frames = match self.manager.seek(seconds) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Seek to {seconds:.3}s failed: {e}");
                return Err(e);
            }
        };

        self.status.reconciler.lock().reset(frames);
        self.finished = false;
        if self.state() == PlaybackState::Playing {
            self.manager.feed();
        }
        Ok(())
    }

    pub fn set_loop(&mut self, enabled: bool) {
        debug!("Looping {}", if enabled { "enabled" } else { "disabled" });
        self.manager.set_loop(enabled);
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    pub fn current_time(&self) -> f64 {
        self.status.current_time()
    }

    pub fn duration(&self) -> f64 {
        self.status.duration()
    }

    pub fn on_ended(&self, callback: EndedCallback) {
        self.status.set_on_ended(callback);
    }

    /// Halt playback and return to the start of the stream.
    pub fn stop(&mut self) {
        self.manager.set_active(false);
        self.status.reconciler.lock().set_active(false);
        if self.manager.is_open() {
            self.rewind();
        }
        self.set_state(PlaybackState::Stopped);
    }

    /// Close the stream and empty the render side.
    pub fn close(&mut self) {
        self.manager.set_active(false);
        self.manager.close();
        {
            let mut reconciler = self.status.reconciler.lock();
            reconciler.set_active(false);
            reconciler.reset(0);
        }
        *self.status.stream.write() = None;
        self.finished = false;
        self.set_state(PlaybackState::Stopped);
    }

    /// One control-domain step: apply render events, then top up the queue.
    pub fn tick(&mut self) {
        let now = self.status.clock.now();
        let summary = {
            let mut reconciler = self.status.reconciler.lock();
            self.manager.process_events(&mut reconciler, now)
        };

        for _ in 0..summary.loop_restarts {
            self.emit(EngineEvent::LoopRestarted);
        }
        if summary.underrun_frames > 0 {
            self.emit(EngineEvent::Underrun(summary.underrun_frames));
        }
        if summary.ended {
            self.finish();
        }

        if self.state() == PlaybackState::Playing {
            self.manager.feed();
        }
    }

    fn finish(&mut self) {
        info!("Playback finished");
        self.finished = true;
        self.manager.set_active(false);
        self.status.reconciler.lock().set_active(false);
        self.set_state(PlaybackState::Stopped);
        self.emit(EngineEvent::Ended);
        self.status.fire_ended();
    }

    fn rewind(&mut self) {
        match self.manager.seek(0.0) {
            Ok(frames) => {
                self.status.reconciler.lock().reset(frames);
                self.finished = false;
            }
            Err(e) => warn!("Could not rewind stream: {e}"),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, new_state: PlaybackState) {
        let old_state = {
            let mut state = self.status.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("State changed: {:?} -> {:?}", old_state, new_state);
            self.emit(EngineEvent::StateChanged(new_state));
        }
    }
}

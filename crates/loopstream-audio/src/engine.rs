//! Threaded playback engine.
//!
//! [`AudioEngine`] owns a control thread that holds the output stream and the
//! [`PlaybackController`]. Callers talk to it over a command channel; the
//! thread wakes at least every `feed_interval_ms` to apply render events and
//! top up the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use loopstream_core::{EngineConfig, Error, Result, StreamInfo};
use tracing::{debug, error, info};

use crate::consumer::RenderConsumer;
use crate::controller::{EndedCallback, EngineEvent, PlaybackController, PlaybackState, PlaybackStatus};
use crate::decode::DecoderFactory;
use crate::manager::DecodeBufferManager;
use crate::output::AudioOutput;
use crate::position::{HostClock, MonotonicClock};
use crate::protocol::render_channel;

/// Commands to control the audio engine.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Open a stream, replying with its metadata.
    Open(PathBuf, Sender<Result<StreamInfo>>),
    /// Start or resume playback.
    Play,
    /// Pause playback.
    Pause,
    /// Stop playback and rewind.
    Stop,
    /// Seek to a position in seconds, replying with the outcome.
    Seek(f64, Sender<Result<()>>),
    /// Enable or disable looping.
    SetLoop(bool),
    /// Close the open stream.
    Close,
    /// Shutdown the engine.
    Shutdown,
}

/// Streaming playback engine.
pub struct AudioEngine {
    status: PlaybackStatus,
    sample_rate: u32,
    command_tx: Sender<EngineCommand>,
    event_rx: Receiver<EngineEvent>,
    worker: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Start the engine on the default output device.
    ///
    /// Blocks until the output stream is running so device errors surface here.
    pub fn new(config: EngineConfig, factory: DecoderFactory) -> Result<Self> {
        config.validate()?;

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (init_tx, init_rx) = bounded::<Result<(PlaybackStatus, u32)>>(1);

        let worker = std::thread::Builder::new()
            .name("loopstream-control".to_string())
            .spawn(move || {
                // cpal::Stream is not Send, so the output lives on this thread.
                let mut link = None;
                let output = match AudioOutput::new(config.output_sample_rate, |rate| {
                    let (control, endpoint) = render_channel(&config);
                    link = Some(control);
                    RenderConsumer::new(endpoint, &config, rate)
                }) {
                    Ok(output) => output,
                    Err(e) => {
                        error!("Failed to initialize audio output: {e}");
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                let Some(link) = link else {
                    let _ = init_tx.send(Err(Error::Internal(
                        "render channel was not created".to_string(),
                    )));
                    return;
                };

                let sample_rate = output.sample_rate();
                info!(
                    "Audio output initialized: {} Hz, {} channels, device: {}",
                    sample_rate,
                    output.channels(),
                    output.device_name()
                );

                let clock: Arc<dyn HostClock> = Arc::new(MonotonicClock::new());
                let status = PlaybackStatus::new(
                    sample_rate,
                    Duration::from_millis(config.stale_report_ms),
                    clock,
                );
                let feed_interval = Duration::from_millis(config.feed_interval_ms);
                let manager = DecodeBufferManager::new(factory, link, config, sample_rate);
                let controller = PlaybackController::new(manager, status.clone(), event_tx);

                if init_tx.send(Ok((status, sample_rate))).is_err() {
                    return;
                }

                EngineWorker {
                    command_rx,
                    controller,
                    feed_interval,
                    _output: output,
                }
                .run();
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn engine thread: {e}")))?;

        let (status, sample_rate) = init_rx.recv().map_err(|_| Error::EngineClosed)??;

        Ok(Self {
            status,
            sample_rate,
            command_tx,
            event_rx,
            worker: Some(worker),
        })
    }

    /// Output sample rate every opened stream must match.
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get the current playback state.
    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    /// Metadata of the open stream.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.status.stream_info()
    }

    /// Get the current position in seconds.
    pub fn current_time(&self) -> f64 {
        self.status.current_time()
    }

    /// Get the total duration in seconds.
    pub fn duration(&self) -> f64 {
        self.status.duration()
    }

    /// Send a command to the engine.
    pub fn send_command(&self, command: EngineCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::EngineClosed)
    }

    /// Open a stream and wait for it to be primed.
    pub fn open(&self, path: impl Into<PathBuf>) -> Result<StreamInfo> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send_command(EngineCommand::Open(path.into(), reply_tx))?;
        reply_rx.recv().map_err(|_| Error::EngineClosed)?
    }

    /// Play the open stream.
    pub fn play(&self) -> Result<()> {
        self.send_command(EngineCommand::Play)
    }

    /// Pause playback.
    pub fn pause(&self) -> Result<()> {
        self.send_command(EngineCommand::Pause)
    }

    /// Stop playback and rewind.
    pub fn stop(&self) -> Result<()> {
        self.send_command(EngineCommand::Stop)
    }

    /// Seek to a position in seconds and wait for the outcome.
    pub fn seek(&self, seconds: f64) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send_command(EngineCommand::Seek(seconds, reply_tx))?;
        reply_rx.recv().map_err(|_| Error::EngineClosed)?
    }

    /// Enable or disable looping.
    pub fn set_loop(&self, enabled: bool) -> Result<()> {
        self.send_command(EngineCommand::SetLoop(enabled))
    }

    /// Close the open stream.
    pub fn close(&self) -> Result<()> {
        self.send_command(EngineCommand::Close)
    }

    /// Register a callback fired once per natural end of stream.
    ///
    /// Runs on the control thread.
    pub fn on_ended(&self, callback: impl FnMut() + Send + 'static) {
        let callback: EndedCallback = Box::new(callback);
        self.status.set_on_ended(callback);
    }

    /// Try to receive an event without blocking.
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive events, blocking until one is available.
    pub fn recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.recv().ok()
    }

    /// Receive an event, giving up after `timeout`.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Shutdown the engine and wait for the control thread.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        worker
            .join()
            .map_err(|_| Error::Internal("control thread panicked".to_string()))
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Engine shutdown failed: {e}");
        }
    }
}

/// Control thread state.
struct EngineWorker {
    command_rx: Receiver<EngineCommand>,
    controller: PlaybackController,
    feed_interval: Duration,
    /// Keep output alive for the duration of the worker.
    _output: AudioOutput,
}

impl EngineWorker {
    fn run(mut self) {
        info!("Audio engine worker started");

        loop {
            match self.command_rx.recv_timeout(self.feed_interval) {
                Ok(EngineCommand::Shutdown) => {
                    info!("Audio engine shutting down");
                    break;
                }
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Command channel closed, shutting down");
                    break;
                }
            }

            self.controller.tick();
        }

        self.controller.close();
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Open(path, reply) => {
                let _ = reply.send(self.controller.open(&path));
            }
            EngineCommand::Play => {
                // Failures are reported through the event stream.
                let _ = self.controller.play();
            }
            EngineCommand::Pause => self.controller.pause(),
            EngineCommand::Stop => self.controller.stop(),
            EngineCommand::Seek(seconds, reply) => {
                let _ = reply.send(self.controller.seek(seconds));
            }
            EngineCommand::SetLoop(enabled) => self.controller.set_loop(enabled),
            EngineCommand::Close => self.controller.close(),
            EngineCommand::Shutdown => {
                // Handled in the main loop
            }
        }
    }
}

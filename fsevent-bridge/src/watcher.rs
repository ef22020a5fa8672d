//! Watcher implementation.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelReader, ChannelWriter, Delivery, EventChannel, Received};
use crate::config::{self, DEFAULT_LATENCY_SECS, Directories, WatchConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{Result, WatcherError};
use crate::frame::WatcherId;
use crate::host::RunLoopHost;
use crate::stream::EventStream;

/// Lifecycle state of a [`Watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No subscription.
    Idle,

    /// A subscription is being created and scheduled.
    Starting,

    /// The subscription is scheduled and the host is armed.
    Active,
}

enum State {
    Idle,
    Starting,
    Active(EventStream),
}

/// Where the stream callback writes frames.
#[derive(Clone)]
struct FrameSink {
    writer: Arc<ChannelWriter>,
    identity: Option<WatcherId>,
}

impl FrameSink {
    /// Runs on the run-loop thread: one frame per batch, nothing else.
    fn deliver(&self, paths: &[String]) {
        match self.writer.send(self.identity, paths) {
            Ok(Delivery::Written) => trace!("wrote batch of {} paths", paths.len()),
            Ok(Delivery::Dropped) => debug!("dropped batch of {} paths", paths.len()),
            Err(e) => warn!("failed to write change batch: {e}"),
        }
    }
}

/// Watches an ordered set of directories on a [`RunLoopHost`].
///
/// Change batches either queue up in the watcher's own channel, to be read with
/// [`Watcher::poll`], [`Watcher::has_events`] and [`Watcher::drain_all`], or are
/// routed to a handler by a [`Dispatcher`] shared with other watchers.
pub struct Watcher {
    host: Arc<RunLoopHost>,
    directories: Vec<String>,
    latency: f64,
    state: State,
    sink: FrameSink,
    reader: Option<Arc<ChannelReader>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Watcher {
    /// Create a watcher with its own event channel.
    pub fn new(host: Arc<RunLoopHost>) -> Result<Self> {
        let (reader, writer) = EventChannel::open()?.into_parts();
        Ok(Self {
            host,
            directories: Vec::new(),
            latency: DEFAULT_LATENCY_SECS,
            state: State::Idle,
            sink: FrameSink {
                writer,
                identity: None,
            },
            reader: Some(reader),
            dispatcher: None,
        })
    }

    /// Create a watcher whose batches are delivered to `handler` on the
    /// dispatcher thread. An empty slice is the "no payload" signal.
    pub fn with_dispatcher<F>(
        host: Arc<RunLoopHost>,
        dispatcher: &Arc<Dispatcher>,
        handler: F,
    ) -> Self
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        let id = dispatcher.register(handler);
        Self {
            host,
            directories: Vec::new(),
            latency: DEFAULT_LATENCY_SECS,
            state: State::Idle,
            sink: FrameSink {
                writer: Arc::clone(dispatcher.writer()),
                identity: Some(id),
            },
            reader: None,
            dispatcher: Some(Arc::clone(dispatcher)),
        }
    }

    /// Create a watcher with its own channel from a validated config.
    pub fn from_config(host: Arc<RunLoopHost>, config: &WatchConfig) -> Result<Self> {
        config.validate()?;
        let mut watcher = Self::new(host)?;
        watcher.directories = config.directories.clone();
        watcher.latency = config.latency;
        Ok(watcher)
    }

    /// Replace the watched directories. `None` or an empty list clears them.
    ///
    /// While active, the new set takes effect on the next start.
    pub fn watch(&mut self, directories: impl Into<Directories>) -> Result<&[String]> {
        self.directories = directories.into().into_strings()?;
        Ok(&self.directories)
    }

    /// The watched directories, in order.
    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    /// Set the latency in seconds. Takes effect on the next start.
    pub fn set_latency(&mut self, latency: f64) -> Result<()> {
        config::latency_duration(latency)?;
        self.latency = latency;
        Ok(())
    }

    /// The latency in seconds.
    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// The current configuration.
    pub fn config(&self) -> WatchConfig {
        WatchConfig {
            directories: self.directories.clone(),
            latency: self.latency,
        }
    }

    /// The host this watcher schedules on.
    pub fn host(&self) -> &Arc<RunLoopHost> {
        &self.host
    }

    /// Identity used on the dispatcher channel, if dispatched.
    pub fn id(&self) -> Option<WatcherId> {
        self.sink.identity
    }

    /// Start receiving change notifications. Calling this while active has no
    /// effect. A failure leaves the watcher idle.
    pub fn start(&mut self) -> Result<()> {
        if matches!(self.state, State::Active(_)) {
            return Ok(());
        }
        if self.directories.is_empty() {
            return Err(WatcherError::InvalidState(
                "no directories to watch".to_string(),
            ));
        }
        let latency = config::latency_duration(self.latency)?;

        self.state = State::Starting;
        match self.open_stream(latency) {
            Ok(stream) => {
                self.state = State::Active(stream);
                info!("watching {}", self.directories.join(", "));
                Ok(())
            }
            Err(e) => {
                self.state = State::Idle;
                Err(e)
            }
        }
    }

    fn open_stream(&self, latency: Duration) -> Result<EventStream> {
        let run_loop = self.host.ensure_running()?;

        let sink = self.sink.clone();
        let mut stream = EventStream::create(
            self.directories.clone(),
            latency,
            Box::new(move |paths: &[String]| sink.deliver(paths)),
        )?;
        stream.schedule(&run_loop)?;
        stream.start()?;
        Ok(stream)
    }

    /// Stop receiving change notifications. Calling this while idle has no
    /// effect.
    pub fn stop(&mut self) {
        if let State::Active(mut stream) = mem::replace(&mut self.state, State::Idle) {
            stream.stop();
            stream.invalidate();
            info!("stopped watching {}", stream.paths().join(", "));
        }
    }

    /// Stop, then start again with the current directories and latency.
    pub fn restart(&mut self) -> Result<()> {
        self.stop();
        self.start()
    }

    /// Whether the watcher is active.
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// The lifecycle state.
    pub fn state(&self) -> WatcherState {
        match self.state {
            State::Idle => WatcherState::Idle,
            State::Starting => WatcherState::Starting,
            State::Active(_) => WatcherState::Active,
        }
    }

    /// Shared handle to this watcher's channel, for reading on another thread.
    pub fn events(&self) -> Result<Arc<ChannelReader>> {
        self.reader.clone().ok_or_else(dispatched_error)
    }

    /// Wait up to `timeout` (forever when `None`) for one batch.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Received> {
        self.own_reader()?.poll(timeout)
    }

    /// Whether a batch can be read without blocking.
    pub fn has_events(&self) -> Result<bool> {
        self.own_reader()?.has_events()
    }

    /// Wait up to `initial_timeout` for a batch, then collect every batch that
    /// is already available into one list.
    pub fn drain_all(&self, initial_timeout: Option<Duration>) -> Result<Received> {
        self.own_reader()?.drain_all(initial_timeout)
    }

    /// Send the "no payload" signal, waking whoever waits on this watcher's
    /// batches with an empty one.
    pub fn wake_consumer(&self) -> Result<Delivery> {
        self.sink.writer.send_signal(self.sink.identity)
    }

    fn own_reader(&self) -> Result<&ChannelReader> {
        self.reader.as_deref().ok_or_else(dispatched_error)
    }
}

fn dispatched_error() -> WatcherError {
    WatcherError::InvalidState("events of this watcher are routed through a dispatcher".to_string())
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
        match (&self.dispatcher, self.sink.identity) {
            (Some(dispatcher), Some(id)) => {
                dispatcher.unregister(id);
            }
            _ => self.sink.writer.close(),
        }
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("directories", &self.directories)
            .field("latency", &self.latency)
            .field("state", &self.state())
            .field("id", &self.sink.identity)
            .finish()
    }
}

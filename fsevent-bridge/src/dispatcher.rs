//! Routes batches from many watchers to their handlers on one thread.
//!
//! Every dispatched [`crate::Watcher`] writes identity-tagged frames into the
//! dispatcher's shared channel. The dispatcher thread reads them in order and
//! calls the handler registered for the frame's [`WatcherId`]. Frames for ids
//! that are no longer registered are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace};

use crate::channel::{ChannelReader, ChannelWriter, EventChannel, Next};
use crate::error::{Result, WatcherError};
use crate::frame::WatcherId;
use crate::lock_unpoisoned;

/// Handler called with one batch. An empty slice is the "no payload" signal.
pub type ChangeHandler = Arc<dyn Fn(&[String]) + Send + Sync>;

type Handlers = Arc<RwLock<HashMap<WatcherId, ChangeHandler>>>;

/// Reader thread for a shared, identity-tagged channel.
pub struct Dispatcher {
    writer: Arc<ChannelWriter>,
    handlers: Handlers,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Dispatcher {
    /// Open the shared channel and start the dispatcher thread.
    pub fn spawn() -> Result<Arc<Self>> {
        let (reader, writer) = EventChannel::open_tagged()?.into_parts();
        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));

        let thread_handlers = Arc::clone(&handlers);
        let thread = thread::Builder::new()
            .name("fsevent-dispatcher".to_string())
            .spawn(move || dispatch_loop(&reader, &thread_handlers))
            .map_err(|e| {
                WatcherError::Platform(format!("could not start dispatcher thread: {e}"))
            })?;

        info!("dispatcher started");
        Ok(Arc::new(Self {
            writer,
            handlers,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Register a handler and return the id frames for it must carry.
    pub fn register<F>(&self, handler: F) -> WatcherId
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        let id = WatcherId::next();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));
        debug!("registered {id}");
        id
    }

    /// Remove the handler for `id`. Returns whether one was registered.
    pub fn unregister(&self, id: WatcherId) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!("unregistered {id}");
        }
        removed
    }

    /// Whether a handler is registered for `id`.
    pub fn is_registered(&self, id: WatcherId) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub(crate) fn writer(&self) -> &Arc<ChannelWriter> {
        &self.writer
    }

    /// Close the shared channel and wait for the thread to deliver what is
    /// left. Returns the error that ended the thread, if any.
    pub fn shutdown(&self) -> Result<()> {
        self.writer.close();

        let Some(handle) = lock_unpoisoned(&self.thread).take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            debug!("shutdown requested from the dispatcher thread, detaching");
            return Ok(());
        }
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(WatcherError::Platform(
                "dispatcher thread panicked".to_string(),
            )),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("dispatcher ended with error: {e}");
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Dispatcher")
            .field("registered", &registered)
            .field("closed", &self.writer.is_closed())
            .finish()
    }
}

fn dispatch_loop(reader: &ChannelReader, handlers: &Handlers) -> Result<()> {
    loop {
        let frame = match reader.next_frame(None) {
            Ok(Next::Frame(frame)) => frame,
            Ok(Next::Timeout) => continue,
            Ok(Next::Closed) => {
                info!("dispatcher channel closed");
                return Ok(());
            }
            Err(e) => {
                error!("dispatcher stopped: {e}");
                return Err(e);
            }
        };

        let Some(id) = frame.identity else {
            trace!("dropping frame without identity");
            continue;
        };
        let handler = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        match handler {
            Some(handler) => handler(&frame.paths),
            None => trace!("dropping frame for unregistered {id}"),
        }
    }
}

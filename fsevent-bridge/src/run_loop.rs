//! The notification run loop.
//!
//! A [`RunLoop`] belongs to the thread that created it. [`RunLoop::run`] blocks
//! that thread until a stop request arrives, processing scheduling requests and
//! raw activity sent through any [`RunLoopRef`]. Activity for a source is
//! coalesced: the first change starts a `latency` timer and everything that
//! arrives before it fires is delivered to the source's callback as one batch,
//! on the run-loop thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use tracing::{debug, trace};

use crate::error::{Result, WatcherError};

/// Callback invoked on the run-loop thread with one batch of changed paths.
pub type BatchCallback = Box<dyn FnMut(&[String]) + Send>;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a source scheduled on a run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a fresh source id.
    pub fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

enum LoopMessage {
    Schedule {
        source: SourceId,
        latency: Duration,
        callback: BatchCallback,
    },
    Unschedule(SourceId),
    Activity {
        source: SourceId,
        paths: Vec<String>,
    },
    Stop,
}

struct Source {
    latency: Duration,
    callback: BatchCallback,
    pending: IndexSet<String>,
    deadline: Option<Instant>,
}

impl Source {
    fn record(&mut self, paths: Vec<String>, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.latency);
        }
        self.pending.extend(paths);
    }

    fn flush(&mut self) {
        self.deadline = None;
        let batch: Vec<String> = self.pending.drain(..).collect();
        (self.callback)(&batch);
    }
}

/// A run loop owned by the thread that created it.
pub struct RunLoop {
    rx: Receiver<LoopMessage>,
    handle: RunLoopRef,
    sources: HashMap<SourceId, Source>,
}

impl RunLoop {
    /// Create a run loop for the current thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            handle: RunLoopRef {
                tx,
                waiting: Arc::new(AtomicBool::new(false)),
            },
            sources: HashMap::new(),
        }
    }

    /// A handle other threads can use to reach this loop.
    pub fn handle(&self) -> RunLoopRef {
        self.handle.clone()
    }

    /// Number of scheduled sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Process messages until [`RunLoopRef::stop`] is called. Batches still
    /// waiting for their latency timer are kept for the next run.
    pub fn run(&mut self) {
        loop {
            self.flush_due(Instant::now());

            let received = match self.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    self.handle.waiting.store(true, Ordering::Release);
                    let received = self.rx.recv_timeout(timeout);
                    self.handle.waiting.store(false, Ordering::Release);
                    received
                }
                None => {
                    self.handle.waiting.store(true, Ordering::Release);
                    let received = self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected);
                    self.handle.waiting.store(false, Ordering::Release);
                    received
                }
            };

            match received {
                Ok(LoopMessage::Stop) => return,
                Ok(message) => self.handle_message(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Schedule {
                source,
                latency,
                callback,
            } => {
                debug!("scheduled {source} with latency {latency:?}");
                self.sources.insert(
                    source,
                    Source {
                        latency,
                        callback,
                        pending: IndexSet::new(),
                        deadline: None,
                    },
                );
            }
            LoopMessage::Unschedule(source) => {
                if self.sources.remove(&source).is_some() {
                    debug!("unscheduled {source}");
                }
            }
            LoopMessage::Activity { source, paths } => match self.sources.get_mut(&source) {
                Some(entry) => entry.record(paths, Instant::now()),
                None => trace!("activity for unscheduled {source} ignored"),
            },
            LoopMessage::Stop => {}
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sources.values().filter_map(|s| s.deadline).min()
    }

    fn flush_due(&mut self, now: Instant) {
        for source in self.sources.values_mut() {
            if source.deadline.is_some_and(|deadline| deadline <= now) {
                source.flush();
            }
        }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, thread-safe handle to a [`RunLoop`].
#[derive(Clone)]
pub struct RunLoopRef {
    tx: Sender<LoopMessage>,
    waiting: Arc<AtomicBool>,
}

impl RunLoopRef {
    /// Register `callback` for `source`. Activity signaled for the source is
    /// delivered no sooner than `latency` after the first change of a batch.
    pub fn schedule(
        &self,
        source: SourceId,
        latency: Duration,
        callback: BatchCallback,
    ) -> Result<()> {
        self.tx
            .send(LoopMessage::Schedule {
                source,
                latency,
                callback,
            })
            .map_err(|_| WatcherError::Platform("run loop is gone".to_string()))
    }

    /// Remove `source`, discarding any batch it has not delivered yet.
    pub fn unschedule(&self, source: SourceId) {
        let _ = self.tx.send(LoopMessage::Unschedule(source));
    }

    /// Report changed paths for `source`.
    pub fn signal_activity(&self, source: SourceId, paths: Vec<String>) {
        if self
            .tx
            .send(LoopMessage::Activity { source, paths })
            .is_err()
        {
            trace!("run loop is gone, activity for {source} dropped");
        }
    }

    /// Make the current (or next) [`RunLoop::run`] call return.
    pub fn stop(&self) {
        let _ = self.tx.send(LoopMessage::Stop);
    }

    /// Whether the loop is blocked waiting for input.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RunLoopRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoopRef")
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

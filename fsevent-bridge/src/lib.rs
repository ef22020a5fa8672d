//! # FSEvent Bridge
//!
//! This crate relays file system change notifications from a background
//! run-loop thread to consumer threads with bounded latency.
//!
//! ## Features
//!
//! - **Run-loop Host**: One parked background thread per host that enters the
//!   notification loop on demand and can be stopped without blocking callers
//! - **Watchers**: Start/stop/restart subscriptions for an ordered set of
//!   directories with a configurable latency
//! - **Pipe Channel**: Length-prefixed, newline-joined batches carried through a
//!   self-pipe, read with `poll`, `has_events` and `drain_all`
//! - **Dispatcher**: One reader thread routing batches from many watchers
//!   sharing a host to per-watcher handlers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        FSEvent Bridge                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Watcher ──► EventStream ──► RunLoop (host thread)              │
//! │                                   │ callback                    │
//! │                                   ▼                             │
//! │                            EventChannel (pipe)                  │
//! │                                   │                             │
//! │                    ┌──────────────┴──────────────┐              │
//! │                    ▼                             ▼              │
//! │             Watcher::poll                   Dispatcher          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod host;
pub mod run_loop;
pub mod stream;
pub mod watcher;

pub use channel::{ChannelReader, ChannelWriter, Delivery, EventChannel, Received};
pub use config::{Directories, WatchConfig};
pub use dispatcher::Dispatcher;
pub use error::{Result, WatcherError};
pub use frame::{Frame, WatcherId};
pub use host::RunLoopHost;
pub use run_loop::{RunLoop, RunLoopRef, SourceId};
pub use stream::EventStream;
pub use watcher::{Watcher, WatcherState};

/// Lock a mutex, recovering the data if another thread panicked while holding
/// it. None of the guarded state can be left half-updated by a panic.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

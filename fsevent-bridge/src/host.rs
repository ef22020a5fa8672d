//! Background thread hosting a [`RunLoop`].

use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{Result, WatcherError};
use crate::lock_unpoisoned;
use crate::run_loop::{RunLoop, RunLoopRef};

static SHARED_HOST: OnceLock<Arc<RunLoopHost>> = OnceLock::new();

/// Owns one background thread that parks until asked to run its loop.
///
/// Exactly one thread ever enters [`RunLoop::run`] per host. Every other
/// thread only signals it through [`RunLoopHost::ensure_running`],
/// [`RunLoopHost::stop`] and [`RunLoopHost::teardown`], none of which wait for
/// the loop itself.
pub struct RunLoopHost {
    shared: Arc<HostShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct HostShared {
    state: Mutex<HostState>,
    cond: Condvar,
    run_loop: Mutex<Option<RunLoopRef>>,
}

#[derive(Debug, Default)]
struct HostState {
    /// The parked thread should enter the loop.
    wake: bool,

    /// Cleared by teardown; the thread exits instead of parking again.
    keep_looping: bool,

    /// True only while the thread is inside `RunLoop::run`.
    running: bool,

    /// A stop request has been sent for the current run.
    stop_pending: bool,
}

impl RunLoopHost {
    /// Create a host and start its thread, parked.
    pub fn new() -> Result<Arc<Self>> {
        let host = Arc::new(Self {
            shared: Arc::new(HostShared {
                state: Mutex::new(HostState::default()),
                cond: Condvar::new(),
                run_loop: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        });
        host.ensure_thread()?;
        Ok(host)
    }

    /// The process-wide default host.
    pub fn shared() -> Result<Arc<Self>> {
        if let Some(host) = SHARED_HOST.get() {
            return Ok(Arc::clone(host));
        }
        let host = Self::new()?;
        Ok(Arc::clone(SHARED_HOST.get_or_init(|| host)))
    }

    /// Make sure the thread exists and is inside its loop. Returns the loop
    /// handle so callers can schedule sources on it.
    ///
    /// Never blocks on the loop: the caller only waits (yielding) for a newly
    /// spawned thread to publish its handle.
    pub fn ensure_running(&self) -> Result<RunLoopRef> {
        let run_loop = self.ensure_thread()?;

        let mut state = lock_unpoisoned(&self.shared.state);
        if !state.running || state.stop_pending {
            // A run that is already being stopped re-enters right away.
            state.wake = true;
            self.shared.cond.notify_one();
            debug!("signaled run loop thread");
        }

        Ok(run_loop)
    }

    /// Ask the loop to return. The thread goes back to parking.
    pub fn stop(&self) {
        let mut state = lock_unpoisoned(&self.shared.state);
        self.request_stop(&mut state);
    }

    /// Whether the thread is inside its loop.
    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.shared.state).running
    }

    /// Whether the loop is running and busy rather than waiting for input.
    pub fn is_active(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        lock_unpoisoned(&self.shared.run_loop)
            .as_ref()
            .is_some_and(|run_loop| !run_loop.is_waiting())
    }

    /// Whether the background thread is alive.
    pub fn is_alive(&self) -> bool {
        lock_unpoisoned(&self.thread)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Handle to the loop, present while the thread is alive.
    pub fn run_loop(&self) -> Option<RunLoopRef> {
        lock_unpoisoned(&self.shared.run_loop).clone()
    }

    /// Stop the loop, let the thread exit and join it.
    ///
    /// Idempotent and infallible. When called from the host thread itself the
    /// thread is detached instead of joined. A later
    /// [`RunLoopHost::ensure_running`] starts a fresh thread.
    pub fn teardown(&self) {
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.keep_looping = false;
            state.wake = false;
            self.request_stop(&mut state);
            self.shared.cond.notify_all();
        }

        let handle = lock_unpoisoned(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("teardown requested from the run loop thread, detaching");
            } else if handle.join().is_err() {
                warn!("run loop thread panicked");
            } else {
                info!("run loop host stopped");
            }
        }

        lock_unpoisoned(&self.shared.run_loop).take();
    }

    fn request_stop(&self, state: &mut HostState) {
        if !state.running || state.stop_pending {
            return;
        }
        if let Some(run_loop) = lock_unpoisoned(&self.shared.run_loop).as_ref() {
            run_loop.stop();
            state.stop_pending = true;
            state.wake = false;
            debug!("requested run loop stop");
        }
    }

    fn ensure_thread(&self) -> Result<RunLoopRef> {
        let mut slot = lock_unpoisoned(&self.thread);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            if let Some(run_loop) = self.run_loop() {
                return Ok(run_loop);
            }
        }

        if let Some(finished) = slot.take() {
            if finished.join().is_err() {
                warn!("previous run loop thread panicked");
            }
        }

        *lock_unpoisoned(&self.shared.state) = HostState {
            keep_looping: true,
            ..HostState::default()
        };

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("fsevent-run-loop".to_string())
            .spawn(move || host_main(&shared))
            .map_err(|e| WatcherError::Platform(format!("could not start run loop thread: {e}")))?;

        // The handle shows up as soon as the thread has created its loop.
        let run_loop = loop {
            if let Some(run_loop) = self.run_loop() {
                break run_loop;
            }
            if handle.is_finished() {
                let _ = handle.join();
                return Err(WatcherError::Platform(
                    "run loop thread exited before creating its loop".to_string(),
                ));
            }
            thread::yield_now();
        };

        *slot = Some(handle);
        info!("run loop host started");
        Ok(run_loop)
    }
}

impl Drop for RunLoopHost {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn host_main(shared: &HostShared) {
    block_signals();

    let mut run_loop = RunLoop::new();
    *lock_unpoisoned(&shared.run_loop) = Some(run_loop.handle());

    loop {
        {
            let mut state = lock_unpoisoned(&shared.state);
            while !state.wake && state.keep_looping {
                state = shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if !state.keep_looping {
                break;
            }
            state.wake = false;
            state.running = true;
        }

        debug!("entering run loop");
        run_loop.run();
        debug!("run loop returned");

        let mut state = lock_unpoisoned(&shared.state);
        state.running = false;
        state.stop_pending = false;
    }

    lock_unpoisoned(&shared.run_loop).take();
    debug!("run loop thread exiting");
}

/// Signals are handled by the rest of the process, never on this thread.
fn block_signals() {
    // SAFETY: the set is zero-initialized, then filled by sigfillset before
    // pthread_sigmask reads it.
    let rv = unsafe {
        let mut all: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut all);
        libc::pthread_sigmask(libc::SIG_BLOCK, &all, std::ptr::null_mut())
    };
    if rv != 0 {
        warn!("could not block signals on the run loop thread: error {rv}");
    }
}

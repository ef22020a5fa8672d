//! Pipe-backed channel carrying framed change batches between threads.
//!
//! The writer side is used from the run-loop thread inside stream callbacks;
//! the reader side is used by a consumer thread (directly or through a
//! [`crate::Dispatcher`]). Both descriptors are non-blocking; blocking waits go
//! through `poll(2)` so they can be bounded by a timeout.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, TryLockError, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{Result, WatcherError};
use crate::frame::{self, Frame, FrameDecoder, WatcherId};
use crate::lock_unpoisoned;

/// How long a writer waits for the reader to make room before re-checking
/// whether the channel was closed.
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Longest a single [`ChannelWriter::write_frame`] call waits for room.
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

/// Result of a consumer-side read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One or more changed paths, in write order. Empty for the "no payload"
    /// sentinel.
    Changes(Vec<String>),

    /// The timeout elapsed before a complete frame arrived.
    NoEvents,

    /// The write end is closed and every frame has been read.
    Closed,
}

impl Received {
    /// The changed paths, if any were received.
    pub fn into_changes(self) -> Option<Vec<String>> {
        match self {
            Self::Changes(paths) => Some(paths),
            Self::NoEvents | Self::Closed => None,
        }
    }
}

/// What happened to a frame handed to [`ChannelWriter::write_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame is committed: it is in the pipe, or its start is and the
    /// rest follows before any other frame.
    Written,

    /// The frame was discarded because the channel is closed or the reader
    /// stopped draining it.
    Dropped,
}

/// Outcome of a single frame read, used by the dispatcher loop.
#[derive(Debug)]
pub(crate) enum Next {
    Frame(Frame),
    Timeout,
    Closed,
}

/// A unidirectional pipe with a writer and a reader half.
pub struct EventChannel {
    reader: Arc<ChannelReader>,
    writer: Arc<ChannelWriter>,
}

impl EventChannel {
    /// Open a channel whose frames carry no sender identity.
    pub fn open() -> Result<Self> {
        Self::with_decoder(FrameDecoder::plain())
    }

    /// Open a channel whose frames are prefixed with a [`WatcherId`].
    pub fn open_tagged() -> Result<Self> {
        Self::with_decoder(FrameDecoder::tagged())
    }

    fn with_decoder(decoder: FrameDecoder) -> Result<Self> {
        let (read_fd, write_fd) = create_pipe()?;
        let writer = Arc::new(ChannelWriter {
            state: Mutex::new(WriterState {
                file: Some(File::from(write_fd)),
                pending: BytesMut::new(),
            }),
            closed: AtomicBool::new(false),
        });
        let reader = Arc::new(ChannelReader {
            decoder,
            file: File::from(read_fd),
            state: Mutex::new(ReaderState {
                buf: BytesMut::new(),
                eof: false,
                failure: None,
                waiting_on_pipe: false,
            }),
            changed: Condvar::new(),
            writer: Arc::downgrade(&writer),
        });
        Ok(Self { reader, writer })
    }

    /// The reader half.
    pub fn reader(&self) -> &Arc<ChannelReader> {
        &self.reader
    }

    /// The writer half.
    pub fn writer(&self) -> &Arc<ChannelWriter> {
        &self.writer
    }

    /// Split into both halves.
    pub fn into_parts(self) -> (Arc<ChannelReader>, Arc<ChannelWriter>) {
        (self.reader, self.writer)
    }
}

/// Writer half of an [`EventChannel`].
pub struct ChannelWriter {
    state: Mutex<WriterState>,
    closed: AtomicBool,
}

struct WriterState {
    file: Option<File>,

    /// Tail of a frame the pipe had no room for. Always written before
    /// anything else so frames never interleave.
    pending: BytesMut,
}

impl ChannelWriter {
    /// Encode and write one batch.
    pub fn send<S: AsRef<str>>(
        &self,
        identity: Option<WatcherId>,
        paths: &[S],
    ) -> Result<Delivery> {
        self.write_frame(&frame::encode(identity, paths))
    }

    /// Write the "no payload" sentinel.
    pub fn send_signal(&self, identity: Option<WatcherId>) -> Result<Delivery> {
        self.send::<&str>(identity, &[])
    }

    /// Write an already encoded frame as a unit.
    ///
    /// Never waits longer than [`WRITE_STALL_LIMIT`]. If the pipe fills up
    /// halfway through the frame, the rest is kept and pushed out ahead of the
    /// next frame or as soon as the reader drains the pipe. A frame that
    /// cannot start because an earlier tail is still stuck is dropped. A
    /// closed channel is not an error: the frame is dropped.
    pub fn write_frame(&self, frame: &[u8]) -> Result<Delivery> {
        if self.is_closed() {
            trace!("channel closed, dropping frame");
            return Ok(Delivery::Dropped);
        }

        let mut state = lock_unpoisoned(&self.state);
        let WriterState { file, pending } = &mut *state;
        let Some(file) = file.as_ref() else {
            return Ok(Delivery::Dropped);
        };
        let deadline = Instant::now() + WRITE_STALL_LIMIT;

        if !pending.is_empty() {
            let n = self.write_until(file, pending, Some(deadline))?;
            pending.advance(n);
            if !pending.is_empty() {
                if !self.is_closed() {
                    warn!(
                        "reader is not draining the channel, dropping {} byte frame",
                        frame.len()
                    );
                }
                return Ok(Delivery::Dropped);
            }
        }

        let n = self.write_until(file, frame, Some(deadline))?;
        if n == 0 {
            if !self.is_closed() {
                warn!(
                    "reader is not draining the channel, dropping {} byte frame",
                    frame.len()
                );
            }
            return Ok(Delivery::Dropped);
        }
        if n < frame.len() {
            pending.extend_from_slice(&frame[n..]);
            debug!("channel full, {} bytes of a frame left for later", pending.len());
        }
        Ok(Delivery::Written)
    }

    /// Push out a frame tail left by [`Self::write_frame`] without waiting.
    /// Skipped when another thread is already writing.
    fn flush_pending(&self) {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        let WriterState { file, pending } = &mut *state;
        let Some(file) = file.as_ref() else {
            return;
        };
        if pending.is_empty() {
            return;
        }
        match self.write_until(file, pending, None) {
            Ok(n) => pending.advance(n),
            Err(e) => warn!("failed to flush frame tail: {e}"),
        }
    }

    /// Write as much of `bytes` as the pipe takes before `deadline`, or
    /// without waiting at all when there is none. Returns the bytes written.
    fn write_until(
        &self,
        mut file: &File,
        bytes: &[u8],
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match file.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline
                        .map_or(Duration::ZERO, |d| d.saturating_duration_since(Instant::now()));
                    if self.is_closed() || remaining.is_zero() {
                        break;
                    }
                    wait_fd(
                        file.as_fd(),
                        libc::POLLOUT,
                        Some(remaining.min(WRITE_RETRY_INTERVAL)),
                    )?;
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    trace!("reader gone, closing channel");
                    self.closed.store(true, Ordering::Release);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    /// Close the write end. Readers see [`Received::Closed`] once they have
    /// drained what is buffered. Safe to call repeatedly and concurrently with
    /// [`Self::write_frame`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = lock_unpoisoned(&self.state);
        let WriterState { file, pending } = &mut *state;
        if let Some(file) = file.take() {
            if !pending.is_empty() {
                if let Ok(n) = self.write_until(&file, pending, None) {
                    pending.advance(n);
                }
                if !pending.is_empty() {
                    warn!(
                        "closing channel with {} bytes of a frame unwritten",
                        pending.len()
                    );
                }
            }
        }
        pending.clear();
    }

    /// Whether [`Self::close`] has been called or the reader is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader half of an [`EventChannel`].
///
/// Any number of threads may read. At most one of them waits on the pipe; the
/// others wait for it to report that the buffer changed, so no thread holds
/// the buffer lock while blocked.
pub struct ChannelReader {
    decoder: FrameDecoder,
    file: File,
    state: Mutex<ReaderState>,
    changed: Condvar,
    writer: Weak<ChannelWriter>,
}

struct ReaderState {
    buf: BytesMut,
    eof: bool,
    failure: Option<String>,

    /// A thread is blocked in `poll(2)` on the pipe.
    waiting_on_pipe: bool,
}

impl ReaderState {
    /// Move whatever the pipe currently holds into the receive buffer.
    fn fill(&mut self, mut file: &File) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode(&mut self, decoder: FrameDecoder) -> Result<Option<Frame>> {
        if let Some(reason) = &self.failure {
            return Err(WatcherError::Protocol(reason.clone()));
        }
        decoder.decode(&mut self.buf).inspect_err(|e| {
            self.failure = Some(e.to_string());
        })
    }
}

impl ChannelReader {
    /// Wait up to `timeout` (forever when `None`) for one batch.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Received> {
        Ok(match self.next_frame(timeout)? {
            Next::Frame(frame) => Received::Changes(frame.paths),
            Next::Timeout => Received::NoEvents,
            Next::Closed => Received::Closed,
        })
    }

    /// Whether a complete frame can be read without blocking. Nothing is
    /// consumed. Never waits; while another thread is blocked reading the
    /// pipe, whatever arrives belongs to that thread and this returns `false`
    /// unless a frame is already buffered.
    pub fn has_events(&self) -> Result<bool> {
        let mut state = lock_unpoisoned(&self.state);
        if self.decoder.has_frame(&state.buf)? {
            return Ok(true);
        }
        if state.eof || state.waiting_on_pipe {
            return Ok(false);
        }
        if wait_fd(self.file.as_fd(), libc::POLLIN, Some(Duration::ZERO))? {
            let filled = state.fill(&self.file);
            self.after_fill();
            filled?;
        }
        self.decoder.has_frame(&state.buf)
    }

    /// Wait up to `initial_timeout` for a first batch, then append every
    /// further batch that is available without blocking.
    pub fn drain_all(&self, initial_timeout: Option<Duration>) -> Result<Received> {
        let mut paths = match self.poll(initial_timeout)? {
            Received::Changes(paths) => paths,
            other => return Ok(other),
        };

        while self.has_events()? {
            match self.poll(Some(Duration::ZERO))? {
                Received::Changes(more) => paths.extend(more),
                Received::NoEvents | Received::Closed => break,
            }
        }

        Ok(Received::Changes(paths))
    }

    pub(crate) fn next_frame(&self, timeout: Option<Duration>) -> Result<Next> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = lock_unpoisoned(&self.state);

        loop {
            if let Some(frame) = state.decode(self.decoder)? {
                return Ok(Next::Frame(frame));
            }

            if state.eof {
                if state.buf.is_empty() {
                    return Ok(Next::Closed);
                }
                let reason = format!(
                    "channel closed with {} bytes of an incomplete frame",
                    state.buf.len()
                );
                state.failure = Some(reason.clone());
                return Err(WatcherError::Protocol(reason));
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));

            // Half a frame is buffered: its writer may be waiting for room we
            // just made, so come back regularly to let its tail through.
            let wait = if state.buf.is_empty() {
                remaining
            } else {
                Some(remaining.map_or(WRITE_RETRY_INTERVAL, |r| r.min(WRITE_RETRY_INTERVAL)))
            };

            if state.waiting_on_pipe {
                state = match remaining {
                    Some(remaining) if remaining.is_zero() => return Ok(Next::Timeout),
                    Some(remaining) => {
                        self.changed
                            .wait_timeout(state, remaining)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    None => self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner),
                };
                continue;
            }

            state.waiting_on_pipe = true;
            drop(state);
            let ready = wait_fd(self.file.as_fd(), libc::POLLIN, wait);
            state = lock_unpoisoned(&self.state);
            state.waiting_on_pipe = false;

            let filled = match ready {
                Ok(true) => state.fill(&self.file).map(|()| true),
                Ok(false) => Ok(false),
                Err(e) => Err(e.into()),
            };
            self.after_fill();
            if !filled? && wait == remaining {
                return Ok(Next::Timeout);
            }
        }
    }

    /// Called with the state lock held after touching the pipe.
    fn after_fill(&self) {
        self.changed.notify_all();
        // The pipe has room again; let a half written frame through.
        if let Some(writer) = self.writer.upgrade() {
            writer.flush_pending();
        }
    }
}

/// Wait until `fd` is ready for `events`. Returns `false` on timeout.
fn wait_fd(fd: BorrowedFd<'_>, events: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        let timeout_ms = match deadline {
            Some(deadline) => millis_ceil(deadline.saturating_duration_since(Instant::now())),
            None => -1,
        };
        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events,
            revents: 0,
        };

        // SAFETY: `pollfd` is a valid, initialized array of one element and
        // the descriptor stays open for the duration of the call.
        let rv = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rv > 0);
    }
}

fn millis_ceil(duration: Duration) -> libc::c_int {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
}

fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];

    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: pipe(2) succeeded, so both descriptors are open and unowned.
    let (read_fd, write_fd) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&read_fd, &write_fd] {
        set_fd_flag(fd.as_raw_fd(), libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
        set_fd_flag(fd.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    }
    Ok((read_fd, write_fd))
}

fn set_fd_flag(fd: RawFd, get: libc::c_int, set: libc::c_int, flag: libc::c_int) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own with integer arguments only.
    unsafe {
        let flags = libc::fcntl(fd, get);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, set, flags | flag) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

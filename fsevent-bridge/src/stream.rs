//! File system event stream backed by `notify`.
//!
//! An [`EventStream`] is the subscription for one path set. It follows the
//! FSEvents lifecycle: create, schedule on a run loop, start, stop, invalidate,
//! release (drop). Raw backend events are reduced to the directories that
//! changed and forwarded to the run loop, which coalesces them and calls the
//! stream's callback on its own thread.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::config::validate_path;
use crate::error::{Result, WatcherError};
use crate::run_loop::{BatchCallback, RunLoopRef, SourceId};

/// A subscription for an ordered set of paths.
pub struct EventStream {
    source: SourceId,
    paths: Vec<String>,
    latency: Duration,
    callback: Option<BatchCallback>,
    run_loop: Option<RunLoopRef>,
    watcher: Option<RecommendedWatcher>,
}

impl EventStream {
    /// Create a stream for `paths`. No OS resources are taken until
    /// [`EventStream::start`].
    pub fn create(paths: Vec<String>, latency: Duration, callback: BatchCallback) -> Result<Self> {
        if paths.is_empty() {
            return Err(WatcherError::InvalidArgument(
                "a stream needs at least one path".to_string(),
            ));
        }
        for path in &paths {
            validate_path(path)?;
        }

        Ok(Self {
            source: SourceId::next(),
            paths,
            latency,
            callback: Some(callback),
            run_loop: None,
            watcher: None,
        })
    }

    /// The run-loop source backing this stream.
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// The watched paths.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Whether the stream is delivering events.
    pub fn is_started(&self) -> bool {
        self.watcher.is_some()
    }

    /// Attach the stream's callback to `run_loop`. A stream can be scheduled
    /// once.
    pub fn schedule(&mut self, run_loop: &RunLoopRef) -> Result<()> {
        let Some(callback) = self.callback.take() else {
            return Err(WatcherError::InvalidState(
                "stream is already scheduled".to_string(),
            ));
        };
        run_loop.schedule(self.source, self.latency, callback)?;
        self.run_loop = Some(run_loop.clone());
        Ok(())
    }

    /// Begin watching. On failure nothing is left watching.
    pub fn start(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let Some(run_loop) = self.run_loop.clone() else {
            return Err(WatcherError::InvalidState(
                "stream must be scheduled before it is started".to_string(),
            ));
        };

        let roots: Vec<PathBuf> = self.paths.iter().map(PathBuf::from).collect();
        let handler_roots = roots.clone();
        let source = self.source;

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let dirs = changed_directories(&handler_roots, &event.paths);
                    if !dirs.is_empty() {
                        run_loop.signal_activity(source, dirs);
                    }
                }
                Err(e) => warn!("watch error on {source}: {e}"),
            },
        )?;

        for root in &roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            debug!("watching {}", root.display());
        }

        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop delivering events. The stream stays scheduled.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            debug!("stopped {}", self.source);
        }
    }

    /// Detach from the run loop, discarding any undelivered batch.
    pub fn invalidate(&mut self) {
        if let Some(run_loop) = self.run_loop.take() {
            run_loop.unschedule(self.source);
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.stop();
        self.invalidate();
    }
}

/// Reduce raw event paths to the directories they live in, in order and
/// without repeats. A watched root that changes itself is reported as is.
/// Paths that cannot travel in a frame are skipped.
fn changed_directories(roots: &[PathBuf], paths: &[PathBuf]) -> Vec<String> {
    let mut dirs: Vec<String> = Vec::new();
    for path in paths {
        let dir: &Path = if roots.iter().any(|root| root == path) {
            path
        } else {
            match path.parent() {
                Some(parent) => parent,
                None => path,
            }
        };

        let dir = dir.to_string_lossy();
        if dir.is_empty() || dir.contains('\n') {
            warn!("skipping unrepresentable path {dir:?}");
            continue;
        }
        if !dirs.iter().any(|d| d.as_str() == dir) {
            dirs.push(dir.into_owned());
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;
    use tempfile::TempDir;

    use crate::run_loop::RunLoop;

    #[test]
    fn test_changed_directories() {
        let roots = vec![PathBuf::from("/watched")];
        let paths = vec![
            PathBuf::from("/watched/a.txt"),
            PathBuf::from("/watched/b.txt"),
            PathBuf::from("/watched/sub/c.txt"),
            PathBuf::from("/watched"),
            PathBuf::from("/watched/bad\nname/d.txt"),
        ];

        assert_eq!(
            changed_directories(&roots, &paths),
            vec!["/watched", "/watched/sub"]
        );
    }

    #[test]
    fn test_create_requires_paths() {
        let result = EventStream::create(Vec::new(), Duration::ZERO, Box::new(|_: &[String]| {}));
        assert!(matches!(result, Err(WatcherError::InvalidArgument(_))));
    }

    #[test]
    fn test_start_requires_schedule() {
        let temp_dir = TempDir::new().unwrap();
        let mut stream = EventStream::create(
            vec![temp_dir.path().to_string_lossy().into_owned()],
            Duration::ZERO,
            Box::new(|_: &[String]| {}),
        )
        .unwrap();

        assert!(matches!(stream.start(), Err(WatcherError::InvalidState(_))));
        assert!(!stream.is_started());
    }

    #[test]
    fn test_schedule_twice_fails() {
        let run_loop = RunLoop::new();
        let mut stream = EventStream::create(
            vec!["/tmp".to_string()],
            Duration::ZERO,
            Box::new(|_: &[String]| {}),
        )
        .unwrap();

        stream.schedule(&run_loop.handle()).unwrap();
        assert!(matches!(
            stream.schedule(&run_loop.handle()),
            Err(WatcherError::InvalidState(_))
        ));
    }

    #[test]
    fn test_start_fails_for_missing_directory() {
        let run_loop = RunLoop::new();
        let mut stream = EventStream::create(
            vec!["/nonexistent/path/12345".to_string()],
            Duration::ZERO,
            Box::new(|_: &[String]| {}),
        )
        .unwrap();
        stream.schedule(&run_loop.handle()).unwrap();

        assert!(stream.start().is_err());
        assert!(!stream.is_started());
    }

    #[test]
    fn test_stream_delivers_directory_batches() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().canonicalize().unwrap();
        let dir_str = dir.to_string_lossy().into_owned();

        let (handle_tx, handle_rx) = mpsc::channel();
        let loop_thread = std::thread::spawn(move || {
            let mut run_loop = RunLoop::new();
            handle_tx.send(run_loop.handle()).unwrap();
            run_loop.run();
        });
        let run_loop = handle_rx.recv().unwrap();

        let (tx, rx) = mpsc::channel();
        let mut stream = EventStream::create(
            vec![dir_str.clone()],
            Duration::from_millis(50),
            Box::new(move |paths: &[String]| {
                let _ = tx.send(paths.to_vec());
            }),
        )
        .unwrap();
        stream.schedule(&run_loop).unwrap();
        stream.start().unwrap();

        std::fs::write(dir.join("new.txt"), "hello").unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(batch.contains(&dir_str), "unexpected batch {batch:?}");

        drop(stream);
        run_loop.stop();
        loop_thread.join().unwrap();
    }
}

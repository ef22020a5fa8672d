//! End-to-end tests: real directories, a real host thread, real pipes.

use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use fsevent_bridge::{Dispatcher, Received, RunLoopHost, Watcher, WatcherError, WatcherState};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// A temp dir and its canonical path, which is what the backend reports.
fn watched_dir() -> (TempDir, PathBuf, String) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().canonicalize().unwrap();
    let display = path.to_string_lossy().into_owned();
    (temp_dir, path, display)
}

/// Poll until a batch containing `dir` shows up.
fn wait_for_dir(watcher: &Watcher, dir: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Received::Changes(paths) = watcher.poll(Some(Duration::from_millis(500))).unwrap() {
            if paths.iter().any(|p| p == dir) {
                return true;
            }
        }
    }
    false
}

#[test]
fn test_single_directory_round_trip() {
    let (_guard, path, dir) = watched_dir();
    let mut watcher = Watcher::new(RunLoopHost::new().unwrap()).unwrap();
    watcher.watch(dir.as_str()).unwrap();
    watcher.set_latency(0.2).unwrap();
    watcher.start().unwrap();
    assert_eq!(watcher.state(), WatcherState::Active);

    assert_eq!(
        watcher.poll(Some(Duration::from_millis(50))).unwrap(),
        Received::NoEvents
    );
    assert!(!watcher.has_events().unwrap());

    std::fs::write(path.join("hello.txt"), "hello").unwrap();
    let batch = watcher
        .poll(Some(Duration::from_secs(1)))
        .unwrap()
        .into_changes()
        .unwrap_or_default();
    assert!(batch.contains(&dir), "unexpected batch {batch:?}");

    watcher.stop();
    assert!(!watcher.is_running());
}

#[test]
fn test_reader_on_another_thread() {
    let (_guard, path, dir) = watched_dir();
    let mut watcher = Watcher::new(RunLoopHost::new().unwrap()).unwrap();
    watcher.watch(dir.as_str()).unwrap();
    watcher.set_latency(0.1).unwrap();
    watcher.start().unwrap();

    let events = watcher.events().unwrap();
    let expected = dir;
    let consumer = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(paths) = events
                .drain_all(Some(Duration::from_millis(500)))
                .unwrap()
                .into_changes()
            {
                if paths.contains(&expected) {
                    return true;
                }
            }
        }
        false
    });

    thread::sleep(Duration::from_millis(50));
    std::fs::write(path.join("other-thread.txt"), "x").unwrap();
    assert!(consumer.join().unwrap());
}

#[test]
fn test_restart_picks_up_new_directories() {
    let (_first_guard, first_path, first) = watched_dir();
    let (_second_guard, second_path, second) = watched_dir();

    let mut watcher = Watcher::new(RunLoopHost::new().unwrap()).unwrap();
    watcher.watch(first.as_str()).unwrap();
    watcher.set_latency(0.1).unwrap();
    watcher.start().unwrap();

    watcher
        .watch(vec![first_path.as_path(), second_path.as_path()])
        .unwrap();
    assert_eq!(watcher.directories(), [first.clone(), second.clone()]);
    watcher.restart().unwrap();

    std::fs::write(second_path.join("new.txt"), "new").unwrap();
    assert!(wait_for_dir(&watcher, &second));

    std::fs::write(first_path.join("old.txt"), "old").unwrap();
    assert!(wait_for_dir(&watcher, &first));
}

#[test]
fn test_stopped_watcher_delivers_nothing_new() {
    let (_guard, path, _dir) = watched_dir();
    let mut watcher = Watcher::new(RunLoopHost::new().unwrap()).unwrap();
    watcher.watch(path.as_path()).unwrap();
    watcher.set_latency(0.05).unwrap();
    watcher.start().unwrap();
    watcher.stop();

    // Drain anything produced while the subscription was being set up.
    while watcher.poll(Some(Duration::from_millis(200))).unwrap() != Received::NoEvents {}

    std::fs::write(path.join("late.txt"), "late").unwrap();
    assert_eq!(
        watcher.poll(Some(Duration::from_millis(300))).unwrap(),
        Received::NoEvents
    );
}

#[test]
fn test_watchers_share_one_host_thread() {
    let (_a_guard, a_path, a_dir) = watched_dir();
    let (_b_guard, b_path, b_dir) = watched_dir();
    let host = RunLoopHost::new().unwrap();

    let mut a = Watcher::new(Arc::clone(&host)).unwrap();
    a.watch(a_dir.as_str()).unwrap();
    a.set_latency(0.1).unwrap();
    a.start().unwrap();

    let mut b = Watcher::new(Arc::clone(&host)).unwrap();
    b.watch(b_dir.as_str()).unwrap();
    b.set_latency(0.1).unwrap();
    b.start().unwrap();

    std::fs::write(b_path.join("b.txt"), "b").unwrap();
    std::fs::write(a_path.join("a.txt"), "a").unwrap();
    assert!(wait_for_dir(&a, &a_dir));
    assert!(wait_for_dir(&b, &b_dir));

    // Stopping one watcher leaves the other running on the same thread.
    a.stop();
    assert!(host.is_running());
    std::fs::write(b_path.join("b2.txt"), "b").unwrap();
    assert!(wait_for_dir(&b, &b_dir));
}

#[test]
fn test_dispatcher_routes_each_watcher() {
    let (_a_guard, a_path, a_dir) = watched_dir();
    let (_b_guard, b_path, b_dir) = watched_dir();
    let host = RunLoopHost::new().unwrap();
    let dispatcher = Dispatcher::spawn().unwrap();
    let (tx, rx) = mpsc::channel::<(&'static str, Vec<String>)>();

    let tx_a = tx.clone();
    let mut a = Watcher::with_dispatcher(Arc::clone(&host), &dispatcher, move |paths| {
        let _ = tx_a.send(("a", paths.to_vec()));
    });
    let mut b = Watcher::with_dispatcher(Arc::clone(&host), &dispatcher, move |paths| {
        let _ = tx.send(("b", paths.to_vec()));
    });
    for (watcher, dir) in [(&mut a, &a_dir), (&mut b, &b_dir)] {
        watcher.watch(dir.as_str()).unwrap();
        watcher.set_latency(0.1).unwrap();
        watcher.start().unwrap();
    }

    std::fs::write(a_path.join("a.txt"), "a").unwrap();
    std::fs::write(b_path.join("b.txt"), "b").unwrap();

    let mut seen_a = false;
    let mut seen_b = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(seen_a && seen_b) && Instant::now() < deadline {
        let Ok((who, paths)) = rx.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };
        match who {
            "a" => {
                assert!(!paths.contains(&b_dir), "b's change routed to a: {paths:?}");
                seen_a |= paths.contains(&a_dir);
            }
            _ => {
                assert!(!paths.contains(&a_dir), "a's change routed to b: {paths:?}");
                seen_b |= paths.contains(&b_dir);
            }
        }
    }
    assert!(seen_a && seen_b);

    assert!(matches!(
        a.poll(Some(Duration::ZERO)),
        Err(WatcherError::InvalidState(_))
    ));

    drop(a);
    drop(b);
    dispatcher.shutdown().unwrap();
}

#[test]
fn test_host_teardown_then_restart() {
    let (_guard, path, dir) = watched_dir();
    let host = RunLoopHost::new().unwrap();
    let mut watcher = Watcher::new(Arc::clone(&host)).unwrap();
    watcher.watch(dir.as_str()).unwrap();
    watcher.set_latency(0.1).unwrap();
    watcher.start().unwrap();

    watcher.stop();
    host.teardown();
    assert!(!host.is_alive());

    watcher.start().unwrap();
    assert!(host.is_alive());
    std::fs::write(path.join("after-teardown.txt"), "x").unwrap();
    assert!(wait_for_dir(&watcher, &dir));
}

#[test]
fn test_wake_consumer_unblocks_poll() {
    let watcher = Watcher::new(RunLoopHost::new().unwrap()).unwrap();
    let events = watcher.events().unwrap();

    let waiter = thread::spawn(move || events.poll(None).unwrap());
    thread::sleep(Duration::from_millis(50));
    watcher.wake_consumer().unwrap();

    assert_eq!(waiter.join().unwrap(), Received::Changes(Vec::new()));
}

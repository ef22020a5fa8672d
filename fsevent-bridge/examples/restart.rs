//! Two watchers sharing one host and a dispatcher, with a restart that picks
//! up a new directory.
//!
//! Usage: cargo run -p fsevent-bridge --example restart

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fsevent_bridge::{Dispatcher, RunLoopHost, Watcher};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let first = tempfile::tempdir()?;
    let second = tempfile::tempdir()?;
    let first_dir = first.path().canonicalize()?;
    let second_dir = second.path().canonicalize()?;

    let host = RunLoopHost::new()?;
    let dispatcher = Dispatcher::spawn()?;

    let mut alpha = Watcher::with_dispatcher(Arc::clone(&host), &dispatcher, |paths| {
        println!("alpha: {paths:?}");
    });
    let mut beta = Watcher::with_dispatcher(Arc::clone(&host), &dispatcher, |paths| {
        println!("beta: {paths:?}");
    });

    alpha.watch(first_dir.as_path())?;
    alpha.set_latency(0.1)?;
    alpha.start()?;
    beta.watch(second_dir.as_path())?;
    beta.set_latency(0.1)?;
    beta.start()?;

    std::fs::write(first_dir.join("a.txt"), "a")?;
    std::fs::write(second_dir.join("b.txt"), "b")?;
    thread::sleep(Duration::from_millis(500));

    println!("restarting alpha on both directories");
    alpha.watch(vec![first_dir.as_path(), second_dir.as_path()])?;
    alpha.restart()?;

    std::fs::write(second_dir.join("c.txt"), "c")?;
    thread::sleep(Duration::from_millis(500));

    alpha.stop();
    beta.stop();
    host.stop();
    drop((alpha, beta));
    dispatcher.shutdown()?;
    host.teardown();
    Ok(())
}

//! Print the directories that change under the given paths.
//!
//! Usage: cargo run -p fsevent-bridge --example print_changes -- <dir>... [--latency <secs>]

use std::time::Duration;

use anyhow::{Context, bail};
use fsevent_bridge::{Received, RunLoopHost, Watcher};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut dirs = Vec::new();
    let mut latency = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--latency" {
            let value = args.next().context("--latency needs a value")?;
            latency = Some(value.parse::<f64>().context("latency must be a number")?);
        } else {
            dirs.push(arg);
        }
    }
    if dirs.is_empty() {
        bail!("usage: print_changes <dir>... [--latency <secs>]");
    }

    let mut watcher = Watcher::new(RunLoopHost::shared()?)?;
    watcher.watch(dirs)?;
    if let Some(latency) = latency {
        watcher.set_latency(latency)?;
    }
    watcher.start()?;

    println!("Watching {} (Ctrl-C to quit)", watcher.directories().join(", "));
    loop {
        match watcher.drain_all(Some(Duration::from_secs(1)))? {
            Received::Changes(paths) => {
                for path in paths {
                    println!("changed: {path}");
                }
            }
            Received::NoEvents => {}
            Received::Closed => break,
        }
    }

    Ok(())
}

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::Daemon;

/// Handle for a running daemon thread (shutdown + trigger hook).
#[derive(Debug)]
pub struct DaemonHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request an immediate run. Triggers are coalesced: if a run is already
    /// pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop after the current run (if any) and join the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Runs a daemon on its own named thread.
///
/// - Schedule: once on startup, then every `interval`
/// - Single-flight: runs never overlap; a slow run delays the next tick
/// - Failures: logged; the next tick tries again
#[derive(Debug, Clone)]
pub struct DaemonRunner {
    pub interval: Duration,
}

impl DaemonRunner {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn spawn(&self, daemon: Arc<dyn Daemon>) -> DaemonHandle {
        let name = daemon.name();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let interval = self.interval;
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner_loop(daemon, interval, shutdown_rx, trigger_rx))
            .expect("failed to spawn daemon thread");

        DaemonHandle {
            name,
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        }
    }
}

fn runner_loop(
    daemon: Arc<dyn Daemon>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
) {
    let name = daemon.name();
    info!(daemon = name, interval_ms = interval.as_millis() as u64, "daemon started");

    let mut next_tick = Instant::now() + interval;
    let mut pending = true; // run once on startup

    loop {
        // Shutdown has priority.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            // Ticks missed during a slow run are dropped, not queued.
            while next_tick <= now {
                next_tick += interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if !pending {
            let wait = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(wait);
            continue;
        }
        pending = false;

        match daemon.run_once(Utc::now()) {
            Ok(report) if report.advanced > 0 || report.failed > 0 => {
                info!(
                    daemon = name,
                    scanned = report.scanned,
                    advanced = report.advanced,
                    skipped = report.skipped,
                    failed = report.failed,
                    "daemon run finished"
                );
            }
            Ok(report) => {
                debug!(daemon = name, scanned = report.scanned, "daemon run idle");
            }
            Err(err) => {
                warn!(daemon = name, error = %err, "daemon run aborted");
            }
        }
    }

    info!(daemon = name, "daemon stopped");
}

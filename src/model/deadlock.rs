//! Lock hold-time watchdog.
//!
//! Each model lock gets a watchdog thread that periodically acquires and
//! immediately releases it from a probe thread. A probe that cannot get
//! the lock within the timeout means some task has been holding it far
//! beyond any legitimate use, and the process is aborted rather than
//! left wedged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{RecvTimeoutError, bounded};
use tracing::error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1200);

/// Timeout from `STDEADLOCKTIMEOUT` (integer seconds), or the default.
pub fn timeout_from_env() -> Duration {
    match std::env::var("STDEADLOCKTIMEOUT") {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT),
        Err(_) => DEFAULT_TIMEOUT,
    }
}

/// Spawn a watchdog for `lock`. Probes fire every quarter timeout until
/// `shutdown` is set.
pub fn watch<T>(
    name: &'static str,
    lock: Arc<RwLock<T>>,
    timeout: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    thread::Builder::new()
        .name(format!("watchdog-{name}"))
        .spawn(move || {
            let probe_interval = timeout / 4;
            loop {
                sleep_while_running(&shutdown, probe_interval);
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }

                let (tx, rx) = bounded(1);
                let probe_lock = Arc::clone(&lock);
                thread::spawn(move || {
                    // A poisoned lock still acquires; either way the
                    // guard is dropped immediately.
                    drop(probe_lock.write());
                    let _ = tx.send(());
                });

                match rx.recv_timeout(timeout) {
                    Ok(()) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        error!(lock = name, ?timeout, "deadlock detected, aborting");
                        std::process::abort();
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
        .expect("spawn deadlock watchdog")
}

/// Sleep up to `total`, waking early when `shutdown` is set.
pub(crate) fn sleep_while_running(shutdown: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(250)));
    }
}

//! Periodic health sampling thread.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::TransportResult;
use crate::listener::{join_with_timeout, spawn_worker, JOIN_TIMEOUT};

/// Health monitor thread name.
pub const MONITOR_THREAD: &str = "transport_health_monitor";

/// Runs a sampling closure on a fixed cadence until stopped.
pub struct HealthMonitor {
    interval: Duration,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("interval", &self.interval)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl HealthMonitor {
    /// Start sampling every `interval`. The first sample runs one interval
    /// after start.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start<F>(interval: Duration, mut sample: F) -> TransportResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = spawn_worker(MONITOR_THREAD, move || {
            info!(interval_ms = interval.as_millis() as u64, "health monitor started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => sample(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("health monitor stopped");
        })?;

        Ok(Self {
            interval,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Sampling cadence.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the thread is running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.thread.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and join the thread. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().take() {
            join_with_timeout(MONITOR_THREAD, thread, JOIN_TIMEOUT);
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

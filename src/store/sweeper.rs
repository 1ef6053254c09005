use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::Result;
use crate::model::ReservationRecord;
use crate::store::reservations::ReservationStore;

/// Periodically expires lapsed leases and trims old history.
pub struct LeaseSweeper {
    store: Arc<ReservationStore>,
    history_retention: chrono::Duration,
}

/// Handle to a running sweeper thread. Dropping it stops the thread.
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LeaseSweeper {
    pub fn new(store: Arc<ReservationStore>, history_retention: chrono::Duration) -> Self {
        Self {
            store,
            history_retention,
        }
    }

    /// One pass: expire every lapsed `Active` record, then drop history older
    /// than the retention window.
    pub fn sweep_once(&self) -> Result<Vec<ReservationRecord>> {
        let expired = self.store.expire_lapsed()?;
        let dropped = self.store.gc_history(self.history_retention)?;
        if !expired.is_empty() || dropped > 0 {
            debug!(expired = expired.len(), dropped, "sweep finished");
        }
        Ok(expired)
    }

    /// Sweep every `interval` on a dedicated thread until the handle is
    /// stopped or dropped.
    pub fn spawn(self, interval: Duration) -> SweeperHandle {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::spawn(move || {
            info!(interval_ms = interval.as_millis() as u64, "lease sweeper started");
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = self.sweep_once() {
                            // Corruption is not recoverable by sweeping again
                            error!(code = err.code(), %err, "sweep failed, sweeper stopping");
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("lease sweeper stopped");
        });
        SweeperHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

impl SweeperHandle {
    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

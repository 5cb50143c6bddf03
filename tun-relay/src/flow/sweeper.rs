//! Background idle sweeper
//!
//! One task per [`IdleSweeper`], started at most once, ticking the table at
//! a fixed interval until shutdown is signalled through a `watch` channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use super::{FlowTable, ManagedFlow};

/// Owner of the periodic sweep task.
#[derive(Debug)]
pub struct IdleSweeper {
    started: AtomicBool,
    expired: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdleSweeper {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            started: AtomicBool::new(false),
            expired: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep loop on the current runtime.
    ///
    /// Only the first call spawns; later or concurrent calls return `false`.
    /// A sweeper that has been shut down is never restarted.
    pub fn start<F>(&self, table: Arc<FlowTable<F>>, interval: Duration) -> bool
    where
        F: ManagedFlow + 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let expired = Arc::clone(&self.expired);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(interval_ms = interval.as_millis() as u64, "idle sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = table.sweep().len() as u64;
                        expired.fetch_add(evicted, Ordering::Relaxed);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("idle sweeper stopped");
        });

        *self.handle.lock() = Some(handle);
        true
    }

    /// Flows evicted by this sweeper so far
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "idle sweeper task ended abnormally");
            }
        }
    }
}

impl Default for IdleSweeper {
    fn default() -> Self {
        Self::new()
    }
}

//! Reservation sweeper: the only timer-driven behaviour in the core.
//!
//! Runs `KeyPool::sweep` on a fixed interval until stopped. `stop` waits for
//! the task to finish, so a sweep in progress always completes its releases.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::key_pool::KeyPool;

pub struct ReservationSweeper {
    shutdown_tx: watch::Sender<bool>,
    task_handle: JoinHandle<()>,
}

impl ReservationSweeper {
    /// Spawn on the current tokio runtime.
    pub fn spawn(pool: Arc<KeyPool>, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(target: "key_pool", period_ms = period.as_millis() as u64, "reservation sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.sweep(Utc::now());
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            task_handle,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Signal the task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task_handle.await;
        info!(target: "key_pool", "reservation sweeper stopped");
    }
}

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ingest::IngestBuffer;
use crate::store::LogStore;

/// Period of the drain tick
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum entries moved into the store per tick
pub const DRAIN_BATCH_SIZE: usize = 10;

/// Moves one batch from the ingest buffer into the store per call
#[derive(Clone)]
pub struct Drainer {
    buffer: IngestBuffer,
    store: LogStore,
    batch_size: usize,
}

impl Drainer {
    pub fn new(buffer: IngestBuffer, store: LogStore, batch_size: usize) -> Self {
        Self {
            buffer,
            store,
            batch_size,
        }
    }

    /// Run a single tick. Returns how many entries were moved.
    pub fn drain_once(&self) -> usize {
        let batch = self.buffer.take_batch(self.batch_size);
        if batch.is_empty() {
            return 0;
        }

        let moved = batch.len();
        self.store.append(batch);
        trace!(moved, pending = self.buffer.len(), "drained ingest buffer");
        moved
    }
}

/// Periodic task running a [`Drainer`] until stopped
pub struct DrainScheduler {
    /// Cancellation token for stopping the tick loop
    cancel: CancellationToken,

    /// Tick task handle
    task: Option<JoinHandle<()>>,
}

impl DrainScheduler {
    /// Spawn the tick loop. Must be called from within a tokio runtime.
    pub fn start(drainer: Drainer, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let period = period.max(Duration::from_millis(1));

        let task = {
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // A late tick must not turn into a burst of catch-up drains
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,

                        _ = ticker.tick() => {
                            drainer.drain_once();
                        }
                    }
                }

                debug!("drain scheduler stopped");
            })
        };

        debug!(period_ms = period.as_millis() as u64, "drain scheduler started");
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop ticking and release the timer
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for DrainScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

//! The lease, send, remove-or-release cycle shared by every flush trigger.

use crate::config::DeliveryHook;
use crate::error::{DeliveryError, Result};
use crate::queue::QueueStore;
use crate::sender::BatchSender;
use crate::types::RecordId;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Outcome of a flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Records confirmed delivered and removed from the queue.
    pub delivered: usize,

    /// Batches delivered.
    pub batches: usize,

    /// Error of the batch that exhausted its attempts, if any. That batch is
    /// back in `pending`.
    pub failure: Option<DeliveryError>,

    /// The flush did not run because another flush held the guard.
    pub skipped: bool,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.skipped
    }

    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: FlushReport) {
        self.delivered += other.delivered;
        self.batches += other.batches;
        self.failure = other.failure;
        self.skipped = other.skipped;
    }
}

/// Couples the queue and the sender behind a single flush-in-progress guard.
///
/// At most one lease/send/remove cycle runs at a time. `flush` waits for the
/// guard, `try_flush` gives up immediately, `drain` waits a bounded time.
pub struct Pipeline {
    store: QueueStore,
    sender: BatchSender,
    batch_size: usize,
    flush_guard: Mutex<()>,
    on_delivery_error: Option<DeliveryHook>,
}

impl Pipeline {
    pub fn new(
        store: QueueStore,
        sender: BatchSender,
        batch_size: usize,
        on_delivery_error: Option<DeliveryHook>,
    ) -> Self {
        Self {
            store,
            sender,
            batch_size,
            flush_guard: Mutex::new(()),
            on_delivery_error,
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Flush until the queue is empty or a batch fails, waiting for any
    /// flush already in progress.
    pub fn flush(&self) -> Result<FlushReport> {
        let _guard = self.flush_guard.lock();
        self.run()
    }

    /// Flush unless another flush is in progress, in which case this is a
    /// no-op reported as `skipped`.
    pub fn try_flush(&self) -> Result<FlushReport> {
        match self.flush_guard.try_lock() {
            Some(_guard) => self.run(),
            None => {
                debug!("flush already in progress");
                Ok(FlushReport::skipped())
            }
        }
    }

    /// Final drain: flush repeatedly until nothing is pending or an attempt
    /// removed nothing. Waits at most `wait` for an in-flight flush.
    pub fn drain(&self, wait: Duration) -> Result<FlushReport> {
        let Some(_guard) = self.flush_guard.try_lock_for(wait) else {
            warn!(?wait, "in-flight flush did not finish; skipping final drain");
            return Ok(FlushReport::skipped());
        };

        let mut total = FlushReport::default();
        loop {
            let step = self.run()?;
            let delivered = step.delivered;
            total.absorb(step);
            if delivered == 0 || self.store.count_pending()? == 0 {
                return Ok(total);
            }
        }
    }

    /// One flush. The caller holds the guard.
    fn run(&self) -> Result<FlushReport> {
        // A lease seen here was left by a cycle whose release failed
        let stale = self.store.leased_ids()?;
        if !stale.is_empty() {
            warn!(stale = stale.len(), "releasing lease left by an earlier flush");
            self.store.release_lease(&stale)?;
        }

        let mut report = FlushReport::default();
        loop {
            let batch = self.store.lease_batch(self.batch_size)?;
            if batch.is_empty() {
                return Ok(report);
            }
            let ids: Vec<RecordId> = batch.iter().map(|record| record.id).collect();

            match self.sender.send(&batch) {
                Ok(()) => {
                    if let Err(e) = self.store.remove(&ids) {
                        // Delivered but still queued: resent by a later flush
                        error!(batch = ids.len(), error = %e, "failed to remove delivered batch");
                        let _ = self.store.release_lease(&ids);
                        return Err(e.into());
                    }
                    report.delivered += ids.len();
                    report.batches += 1;
                }
                Err(e) => {
                    warn!(
                        batch = ids.len(),
                        first_id = %ids[0],
                        error = %e,
                        "batch delivery failed; records stay queued"
                    );
                    if let Some(hook) = &self.on_delivery_error {
                        hook(&e);
                    }
                    // A lease left behind here is released by the next run
                    self.store.release_lease(&ids)?;
                    report.failure = Some(e);
                    return Ok(report);
                }
            }
        }
    }
}

//! The producer-facing shipper.

use crate::config::Config;
use crate::error::{Error, Result, StorageError};
use crate::pipeline::{FlushReport, Pipeline};
use crate::queue::QueueStore;
use crate::record::RecordDraft;
use crate::scheduler::{FlushNotifier, FlushScheduler, Trigger};
use crate::sender::BatchSender;
use crate::types::{Extras, LogLevel, RecordId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Durable log shipper.
///
/// `log` persists a record before returning and never touches the network.
/// A background worker delivers queued records in batches; records that fail
/// delivery stay queued for a later flush, including across restarts.
///
/// `LogSend` is `Send + Sync`; share it by reference or `Arc`. Dropping it
/// runs [`LogSend::close`].
///
/// ```no_run
/// use logsend::{extras, Config, LogSend};
///
/// let shipper = LogSend::new(Config::new("http://localhost:8686", "billing", "app_logs"))?;
/// shipper.info("invoice sent", extras! { "invoice_id" => 42 })?;
/// shipper.close()?;
/// # Ok::<(), logsend::Error>(())
/// ```
pub struct LogSend {
    config: Config,
    pipeline: Arc<Pipeline>,
    scheduler: Mutex<Option<FlushScheduler>>,
    notifier: FlushNotifier,
    closed: AtomicBool,
}

impl LogSend {
    /// Validate `config`, open the queue and start the flush worker.
    ///
    /// Records left over from a previous session are picked up by the first
    /// flush.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = QueueStore::open(&config.db_path)?;
        let pending = store.count_pending()?;
        let sender = BatchSender::new(&config)?;
        let pipeline = Arc::new(Pipeline::new(
            store,
            sender,
            config.batch_size,
            config.on_delivery_error.clone(),
        ));

        let worker = Arc::clone(&pipeline);
        let scheduler =
            FlushScheduler::start(config.flush_interval, move |trigger| background_flush(&worker, trigger))
                .map_err(StorageError::Io)?;
        let notifier = scheduler.notifier();

        info!(
            url = %config.vector_url,
            db_path = %config.db_path.display(),
            pending,
            "log shipper started"
        );

        Ok(Self {
            config,
            pipeline,
            scheduler: Mutex::new(Some(scheduler)),
            notifier,
            closed: AtomicBool::new(false),
        })
    }

    /// Queue a record.
    ///
    /// Returns `Ok(None)` if `level` is below the configured minimum, and the
    /// assigned id once the record is on disk otherwise. A storage error
    /// means the record was not logged.
    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        extra: Extras,
    ) -> Result<Option<RecordId>> {
        if self.is_closed() {
            return Err(StorageError::Closed.into());
        }
        if level < self.config.level {
            return Ok(None);
        }

        let draft = RecordDraft::new(
            level,
            message,
            self.config.project.as_str(),
            self.config.table.as_str(),
            extra,
            &self.config.extra_fields,
        );
        let id = self.pipeline.store().enqueue(draft)?;
        self.request_flush_if_full();
        Ok(Some(id))
    }

    /// Wake the worker when a full batch is waiting. The record is already
    /// stored, so a failed count only skips the wake-up.
    fn request_flush_if_full(&self) -> bool {
        let full = self
            .pipeline
            .store()
            .count_pending()
            .map_or(false, |pending| pending >= self.config.batch_size);
        full && self.notifier.notify()
    }

    pub fn debug(&self, message: impl Into<String>, extra: Extras) -> Result<Option<RecordId>> {
        self.log(LogLevel::Debug, message, extra)
    }

    pub fn info(&self, message: impl Into<String>, extra: Extras) -> Result<Option<RecordId>> {
        self.log(LogLevel::Info, message, extra)
    }

    pub fn warning(&self, message: impl Into<String>, extra: Extras) -> Result<Option<RecordId>> {
        self.log(LogLevel::Warning, message, extra)
    }

    pub fn error(&self, message: impl Into<String>, extra: Extras) -> Result<Option<RecordId>> {
        self.log(LogLevel::Error, message, extra)
    }

    pub fn critical(&self, message: impl Into<String>, extra: Extras) -> Result<Option<RecordId>> {
        self.log(LogLevel::Critical, message, extra)
    }

    /// Records waiting for delivery, excluding a batch currently in flight.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.pipeline.store().count_pending()?)
    }

    /// Deliver queued records now, waiting for a background flush already in
    /// progress.
    ///
    /// Stops at the first batch that fails all attempts; the report carries
    /// that failure. Safe to call again after a failure.
    pub fn flush(&self) -> Result<FlushReport> {
        if self.is_closed() {
            return Err(StorageError::Closed.into());
        }
        self.pipeline.flush()
    }

    /// Stop the worker, drain the queue and release the store.
    ///
    /// Waits at most `shutdown_timeout` for an in-flight flush. Records that
    /// cannot be delivered stay on disk. Idempotent: later calls return an
    /// empty report.
    pub fn close(&self) -> Result<FlushReport> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(FlushReport::default());
        }

        let timeout = self.config.shutdown_timeout;
        // `None` when the timeout is too large to put on the clock
        let deadline = Instant::now().checked_add(timeout);
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop(timeout);
        }

        let remaining_wait =
            deadline.map_or(timeout, |deadline| deadline.saturating_duration_since(Instant::now()));
        let drained = self.pipeline.drain(remaining_wait);
        let store = self.pipeline.store();
        let remaining = store.count_pending().unwrap_or(0);
        store.close();

        let report = drained?;
        info!(
            delivered = report.delivered,
            pending = remaining,
            "log shipper closed"
        );
        Ok(report)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for LogSend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to close log shipper");
        }
    }
}

fn background_flush(pipeline: &Pipeline, trigger: Trigger) {
    match pipeline.try_flush() {
        Ok(report) if report.delivered > 0 => {
            debug!(?trigger, delivered = report.delivered, batches = report.batches, "flushed");
        }
        Ok(_) => {}
        // A detached worker may outlive the store
        Err(Error::Storage(StorageError::Closed)) => {}
        Err(e) => error!(?trigger, error = %e, "background flush failed"),
    }
}

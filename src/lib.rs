//! # logsend
//!
//! Durable client-side log shipping to an HTTP collector.
//!
//! Records are written to a local append-only queue before `log` returns,
//! then delivered in NDJSON batches by a background worker. Failed deliveries
//! stay queued; the queue survives crashes and restarts.
//!
//! ## Core Concepts
//!
//! - **Queue**: fsynced journal of records, each `pending` or `leased`
//! - **Batch**: up to `batch_size` of the oldest pending records, leased for
//!   one delivery and removed only once the collector accepts it
//! - **Triggers**: a full batch pending, the flush interval, `flush()`, and
//!   the final drain at `close()`
//!
//! Delivery is at-least-once: a crash between a successful POST and the
//! removal of the batch resends it.
//!
//! ## Example
//!
//! ```no_run
//! use logsend::{extras, Config, LogLevel, LogSend};
//!
//! let config = Config::new("http://localhost:8686/logs", "checkout", "app_logs")
//!     .with_db_path("./logs/queue.db")
//!     .with_batch_size(50)
//!     .with_extra_field("environment", "production");
//!
//! let shipper = LogSend::new(config)?;
//! shipper.log(LogLevel::Warning, "payment retried", extras! { "order" => 1042 })?;
//!
//! let report = shipper.flush()?;
//! assert!(report.is_success());
//! shipper.close()?;
//! # Ok::<(), logsend::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod scheduler;
pub mod sender;
pub mod types;

// Re-exports
pub use config::{BasicAuth, Config, DeliveryHook};
pub use error::{ConfigError, DeliveryError, Error, Result, StorageError};
pub use logger::LogSend;
pub use pipeline::{FlushReport, Pipeline};
pub use queue::QueueStore;
pub use record::{encode_ndjson, LogRecord, RecordDraft, RESERVED_KEYS};
pub use scheduler::{FlushNotifier, FlushScheduler, Trigger};
pub use sender::BatchSender;
pub use types::{ExtraValue, Extras, LogLevel, NonFiniteNumber, RecordId, Timestamp};

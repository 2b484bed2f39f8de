//! Shipper configuration.

use crate::error::{ConfigError, DeliveryError};
use crate::record::RESERVED_KEYS;
use crate::types::{ExtraValue, Extras, LogLevel};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Called with the last error of every batch that failed all attempts.
pub type DeliveryHook = Arc<dyn Fn(&DeliveryError) + Send + Sync>;

/// Credentials for HTTP Basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Shipper configuration.
///
/// `vector_url`, `project` and `table` are required; everything else has a
/// default. Checked by [`Config::validate`] before a shipper is built.
#[derive(Clone)]
pub struct Config {
    /// Collector endpoint receiving NDJSON POSTs.
    pub vector_url: String,

    /// Project name, sent with every record.
    pub project: String,

    /// Table name, sent with every record.
    pub table: String,

    /// Queue file location.
    pub db_path: PathBuf,

    /// Records per delivery, and the pending count that triggers a flush.
    pub batch_size: usize,

    /// Period of the background flush timer.
    pub flush_interval: Duration,

    /// Retries after the first failed attempt of a batch.
    pub max_retries: u32,

    /// Fixed pause between attempts.
    pub retry_delay: Duration,

    /// Records below this level are dropped at the call site.
    pub level: LogLevel,

    /// Sent at the top level of every record.
    pub extra_fields: Extras,

    /// Per-request HTTP timeout.
    pub timeout: Duration,

    /// Additional request headers.
    pub headers: Vec<(String, String)>,

    pub basic_auth: Option<BasicAuth>,

    /// Upper bound on waiting for an in-flight flush at close.
    pub shutdown_timeout: Duration,

    pub on_delivery_error: Option<DeliveryHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vector_url: String::new(),
            project: String::new(),
            table: String::new(),
            db_path: PathBuf::from("./logs/queue.db"),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            level: LogLevel::Debug,
            extra_fields: Extras::new(),
            timeout: Duration::from_secs(10),
            headers: Vec::new(),
            basic_auth: None,
            shutdown_timeout: Duration::from_secs(2),
            on_delivery_error: None,
        }
    }
}

impl Config {
    pub fn new(
        vector_url: impl Into<String>,
        project: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            vector_url: vector_url.into(),
            project: project.into(),
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Fractional seconds; negative or non-finite values become zero.
    pub fn with_flush_interval_secs(self, secs: f64) -> Self {
        self.with_flush_interval(secs_to_duration(secs))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Fractional seconds; negative or non-finite values become zero.
    pub fn with_retry_delay_secs(self, secs: f64) -> Self {
        self.with_retry_delay(secs_to_duration(secs))
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_extra_field(mut self, key: impl Into<String>, value: impl Into<ExtraValue>) -> Self {
        self.extra_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_extra_fields(mut self, fields: Extras) -> Self {
        self.extra_fields = fields;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: Option<&str>) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.into(),
            password: password.map(str::to_string),
        });
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn on_delivery_error(
        mut self,
        hook: impl Fn(&DeliveryError) + Send + Sync + 'static,
    ) -> Self {
        self.on_delivery_error = Some(Arc::new(hook));
        self
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vector_url.trim().is_empty() {
            return Err(ConfigError::Missing("vector_url"));
        }
        if self.project.trim().is_empty() {
            return Err(ConfigError::Missing("project"));
        }
        if self.table.trim().is_empty() {
            return Err(ConfigError::Missing("table"));
        }

        let url = reqwest::Url::parse(&self.vector_url).map_err(|e| ConfigError::Invalid {
            field: "vector_url",
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "vector_url",
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("db_path"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "flush_interval",
                reason: "must be greater than zero".into(),
            });
        }

        if let Some(key) = self
            .extra_fields
            .keys()
            .find(|key| RESERVED_KEYS.contains(&key.as_str()))
        {
            return Err(ConfigError::ReservedField(key.clone()));
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("vector_url", &self.vector_url)
            .field("project", &self.project)
            .field("table", &self.table)
            .field("db_path", &self.db_path)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("level", &self.level)
            .field("extra_fields", &self.extra_fields)
            .field("timeout", &self.timeout)
            .field("headers", &self.headers)
            .field("basic_auth", &self.basic_auth)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("on_delivery_error", &self.on_delivery_error.is_some())
            .finish()
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

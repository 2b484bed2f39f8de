//! HTTP delivery of record batches.

use crate::config::{BasicAuth, Config};
use crate::error::{ConfigError, DeliveryError};
use crate::record::{encode_ndjson, LogRecord};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Content type of the request body.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Longest collector response body kept in a [`DeliveryError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Posts batches to the collector, retrying failed attempts with a fixed
/// delay.
///
/// The sender never touches the queue; the caller removes or releases the
/// batch depending on the outcome.
pub struct BatchSender {
    client: Client,
    url: String,
    max_retries: u32,
    retry_delay: Duration,
    basic_auth: Option<BasicAuth>,
}

impl BatchSender {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::Invalid {
                field: "headers",
                reason: format!("{name:?}: {e}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| ConfigError::Invalid {
                field: "headers",
                reason: format!("{name}: {e}"),
            })?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "vector_url",
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            url: config.vector_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            basic_auth: config.basic_auth.clone(),
        })
    }

    /// Deliver one batch.
    ///
    /// Makes one attempt plus up to `max_retries` retries. Returns the error
    /// of the last attempt if none succeeded. An empty batch succeeds
    /// without a request.
    pub fn send(&self, batch: &[LogRecord]) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = encode_ndjson(batch)?;
        let attempts = self.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.post(&body) {
                Ok(()) => {
                    debug!(batch = batch.len(), attempt, "delivered batch");
                    return Ok(());
                }
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        batch = batch.len(),
                        attempt,
                        attempts,
                        status = e.status(),
                        error = %e,
                        "delivery attempt failed, retrying"
                    );
                    if !self.retry_delay.is_zero() {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }
    }

    /// One POST. Any 2xx is success.
    fn post(&self, body: &[u8]) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).body(body.to_vec());
        if let Some(auth) = &self.basic_auth {
            request = request.basic_auth(&auth.username, auth.password.as_ref());
        }

        let response = request.send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut text = response.text().unwrap_or_default();
        if text.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body: text,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

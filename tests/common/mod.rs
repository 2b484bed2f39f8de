//! Shared helpers for integration tests.

#![allow(dead_code)]

use logsend::Config;
use mockito::{Mock, ServerGuard};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Bodies of every POST a collector mock answered.
pub type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

/// Install a test subscriber so shipper diagnostics show up in failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A mock collector answering every POST with `status` and recording bodies.
pub fn collector(server: &mut ServerGuard, status: usize) -> (Mock, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let mock = server
        .mock("POST", "/")
        .with_status(status)
        .with_body_from_request(move |request| {
            let body = request.body().map(|b| b.clone()).unwrap_or_default();
            sink.lock().unwrap().push(body);
            Vec::new()
        })
        .create();
    (mock, captured)
}

/// Config with background triggers effectively disabled.
pub fn quiet_config(url: impl Into<String>, dir: &TempDir) -> Config {
    Config::new(url, "p", "t")
        .with_db_path(dir.path().join("logs").join("queue.db"))
        .with_batch_size(1000)
        .with_flush_interval(Duration::from_secs(3600))
        .with_retry_delay(Duration::ZERO)
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Parse an NDJSON body into its objects.
pub fn ndjson_lines(body: &[u8]) -> Vec<Value> {
    let text = std::str::from_utf8(body).unwrap();
    assert!(text.ends_with('\n'), "body must end with a newline");
    text.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

//! End-to-end delivery tests against a mock collector.

mod common;

use common::{collector, init_tracing, ndjson_lines, quiet_config, wait_for};
use logsend::{extras, Extras, LogLevel, LogSend, QueueStore, RecordDraft};
use mockito::Server;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// --- Flush Outcomes ---

#[test]
fn test_flush_delivers_one_batch_in_id_order() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (mock, captured) = collector(&mut server, 200);

    let shipper = LogSend::new(quiet_config(server.url(), &dir)).unwrap();
    let ids: Vec<u64> = ["first", "second", "third"]
        .iter()
        .map(|m| shipper.info(*m, extras! {}).unwrap().unwrap().0)
        .collect();

    let report = shipper.flush().unwrap();
    assert!(report.is_success());
    assert_eq!(report.delivered, 3);
    assert_eq!(shipper.pending_count().unwrap(), 0);

    let bodies = captured.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let lines = ndjson_lines(&bodies[0]);
    assert_eq!(lines.len(), 3);
    for (line, expected) in lines.iter().zip(["first", "second", "third"]) {
        assert_eq!(line["message"], expected);
        assert_eq!(line["project"], "p");
        assert_eq!(line["table"], "t");
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["level_num"], 20);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    mock.assert();
}

#[test]
fn test_failing_collector_keeps_batch_after_all_attempts() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let mock = server.mock("POST", "/").with_status(500).expect(4).create();

    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let config = quiet_config(server.url(), &dir)
        .with_max_retries(3)
        .with_retry_delay(Duration::ZERO)
        .on_delivery_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    let shipper = LogSend::new(config).unwrap();
    for i in 0..3 {
        shipper.error(format!("e{i}"), extras! {}).unwrap();
    }

    let report = shipper.flush().unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failure.as_ref().and_then(|e| e.status()), Some(500));
    assert_eq!(shipper.pending_count().unwrap(), 3);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    mock.assert();

    // A failed flush can be retried
    let report = shipper.flush().unwrap();
    assert!(!report.is_success());
    assert_eq!(shipper.pending_count().unwrap(), 3);
}

#[test]
fn test_flush_splits_into_batches() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (_mock, captured) = collector(&mut server, 202);

    let shipper = LogSend::new(quiet_config(server.url(), &dir).with_batch_size(4)).unwrap();
    for i in 0..10 {
        shipper.debug(format!("m{i}"), extras! {}).unwrap();
    }
    // Waits for any background flush started by the threshold
    assert!(shipper.flush().unwrap().is_success());
    assert_eq!(shipper.pending_count().unwrap(), 0);

    let bodies = captured.lock().unwrap();
    let sizes: Vec<usize> = bodies.iter().map(|b| ndjson_lines(b).len()).collect();
    assert_eq!(sizes.iter().sum::<usize>(), 10);
    assert!(sizes.iter().all(|n| *n <= 4), "oversized batch: {sizes:?}");
}

// --- Wire Format ---

#[test]
fn test_extra_fields_and_call_site_override() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (_mock, captured) = collector(&mut server, 200);

    let config = quiet_config(server.url(), &dir)
        .with_extra_field("environment", "production")
        .with_extra_field("service", "billing");
    let shipper = LogSend::new(config).unwrap();
    shipper
        .warning(
            "override",
            extras! { "environment" => "staging", "request_id" => "abc" },
        )
        .unwrap();
    shipper.warning("plain", extras! {}).unwrap();
    shipper.flush().unwrap();

    let bodies = captured.lock().unwrap();
    let lines = ndjson_lines(&bodies[0]);

    assert_eq!(lines[0]["environment"], "staging");
    assert_eq!(lines[0]["service"], "billing");
    assert_eq!(lines[0]["extra"]["request_id"], "abc");
    assert!(lines[0].get("request_id").is_none());

    assert_eq!(lines[1]["environment"], "production");
    assert_eq!(lines[1]["extra"], serde_json::json!({}));
    let ts = lines[1]["timestamp"].as_str().unwrap();
    assert!(ts.ends_with('Z'), "timestamp not UTC: {ts}");
}

// --- Triggers ---

#[test]
fn test_interval_flush_without_manual_flush() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (_mock, captured) = collector(&mut server, 200);

    let config = quiet_config(server.url(), &dir).with_flush_interval(Duration::from_millis(200));
    let shipper = LogSend::new(config).unwrap();
    shipper.info("a", extras! {}).unwrap();
    shipper.info("b", extras! {}).unwrap();

    assert!(wait_for(Duration::from_secs(5), || shipper.pending_count().unwrap() == 0));
    assert!(!captured.lock().unwrap().is_empty());
}

#[test]
fn test_full_batch_triggers_background_flush() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (_mock, captured) = collector(&mut server, 200);

    let shipper = LogSend::new(quiet_config(server.url(), &dir).with_batch_size(5)).unwrap();
    for i in 0..5 {
        shipper.info(format!("m{i}"), extras! {}).unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || shipper.pending_count().unwrap() == 0));
    let bodies = captured.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    assert_eq!(ndjson_lines(&bodies[0]).len(), 5);
}

// --- Shutdown & Recovery ---

#[test]
fn test_drop_drains_queue() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (mock, captured) = collector(&mut server, 200);

    {
        let shipper = LogSend::new(quiet_config(server.url(), &dir)).unwrap();
        for i in 0..3 {
            shipper.critical(format!("m{i}"), extras! {}).unwrap();
        }
    }

    assert_eq!(ndjson_lines(&captured.lock().unwrap()[0]).len(), 3);
    mock.assert();

    let store = QueueStore::open(dir.path().join("logs").join("queue.db")).unwrap();
    assert!(store.is_empty().unwrap());
}

#[test]
fn test_close_returns_drain_report() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (_mock, _) = collector(&mut server, 200);

    let shipper = LogSend::new(quiet_config(server.url(), &dir)).unwrap();
    shipper.info("x", extras! {}).unwrap();

    let report = shipper.close().unwrap();
    assert!(report.is_success());
    assert_eq!(report.delivered, 1);
    assert!(shipper.is_closed());
    assert_eq!(shipper.close().unwrap().delivered, 0);
}

#[test]
fn test_records_leased_at_crash_are_delivered_after_restart() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new();
    let (mock, captured) = collector(&mut server, 200);
    let path = dir.path().join("logs").join("queue.db");

    {
        let store = QueueStore::open(&path).unwrap();
        for i in 0..3 {
            let draft = RecordDraft::new(
                LogLevel::Info,
                format!("m{i}"),
                "p",
                "t",
                Extras::new(),
                &Extras::new(),
            );
            store.enqueue(draft).unwrap();
        }
        // Crash mid-flush: batch leased, never removed or released
        assert_eq!(store.lease_batch(2).unwrap().len(), 2);
    }

    let shipper = LogSend::new(quiet_config(server.url(), &dir)).unwrap();
    assert_eq!(shipper.pending_count().unwrap(), 3);
    assert_eq!(shipper.flush().unwrap().delivered, 3);

    let bodies = captured.lock().unwrap();
    let messages: Vec<String> = ndjson_lines(&bodies[0])
        .iter()
        .map(|line| line["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages, vec!["m0", "m1", "m2"]);

    // New ids continue after the recovered ones
    assert_eq!(shipper.info("m3", extras! {}).unwrap().unwrap().0, 4);
    drop(bodies);
    mock.assert();
}

#[test]
fn test_undelivered_records_survive_restart() {
    let dir = TempDir::new().unwrap();

    {
        let mut down = Server::new();
        let _mock = down.mock("POST", "/").with_status(503).create();
        let shipper = LogSend::new(quiet_config(down.url(), &dir).with_max_retries(0)).unwrap();
        shipper.info("kept", extras! { "n" => 1 }).unwrap();
        assert!(!shipper.close().unwrap().is_success());
    }

    let mut up = Server::new();
    let (mock, captured) = collector(&mut up, 200);
    let shipper = LogSend::new(quiet_config(up.url(), &dir)).unwrap();
    assert_eq!(shipper.pending_count().unwrap(), 1);
    assert!(shipper.flush().unwrap().is_success());

    let lines = ndjson_lines(&captured.lock().unwrap()[0]);
    assert_eq!(lines[0]["message"], "kept");
    assert_eq!(lines[0]["extra"]["n"], 1);
    mock.assert();
}

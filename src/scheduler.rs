//! Background flush worker.
//!
//! One named thread per shipper. It flushes when a producer reports that a
//! full batch is pending, and otherwise once every flush interval.

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why the worker is running a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A producer saw at least `batch_size` pending records.
    Threshold,
    /// The flush interval elapsed.
    Interval,
}

/// Requests a flush from the worker without blocking.
#[derive(Clone)]
pub struct FlushNotifier {
    requests: Sender<()>,
}

impl FlushNotifier {
    /// Ask for a flush. Requests made while one is already queued coalesce.
    ///
    /// Returns false once the worker has exited.
    pub fn notify(&self) -> bool {
        match self.requests.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Handle to the flush worker thread.
pub struct FlushScheduler {
    requests: Sender<()>,
    shutdown: Sender<()>,
    /// Disconnected when the worker exits.
    exited: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Spawn the worker. `flush` runs on the worker thread for every trigger.
    pub fn start<F>(interval: Duration, flush: F) -> io::Result<Self>
    where
        F: Fn(Trigger) + Send + 'static,
    {
        let (requests, request_rx) = bounded(1);
        let (shutdown, shutdown_rx) = bounded(1);
        let (exit_signal, exited) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("logsend-flush".into())
            .spawn(move || {
                let _exit_signal = exit_signal;
                run(interval, &request_rx, &shutdown_rx, flush);
            })?;

        debug!(?interval, "started flush scheduler");
        Ok(Self {
            requests,
            shutdown,
            exited,
            handle: Some(handle),
        })
    }

    pub fn notifier(&self) -> FlushNotifier {
        FlushNotifier {
            requests: self.requests.clone(),
        }
    }

    /// Stop the worker, waiting up to `timeout` for an in-flight flush.
    ///
    /// Returns true if the worker exited and was joined. On timeout the
    /// thread is detached and exits after its current flush. Calling this
    /// again is a no-op.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let _ = self.shutdown.try_send(());

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("flush worker panicked");
                }
                debug!("stopped flush scheduler");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "flush worker still busy at shutdown; detaching");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        // Not stopped explicitly: signal and detach
        if self.handle.take().is_some() {
            let _ = self.shutdown.try_send(());
        }
    }
}

fn run<F: Fn(Trigger)>(
    interval: Duration,
    requests: &Receiver<()>,
    shutdown: &Receiver<()>,
    flush: F,
) {
    // `None` when the interval is too large to put on the clock: no ticks
    let mut next_tick = Instant::now().checked_add(interval);
    loop {
        let Some(tick) = next_tick else {
            select! {
                recv(shutdown) -> _ => return,
                recv(requests) -> msg => match msg {
                    Ok(()) => flush(Trigger::Threshold),
                    Err(_) => return,
                },
            }
            continue;
        };

        let wait = tick.saturating_duration_since(Instant::now());
        select! {
            recv(shutdown) -> _ => return,
            recv(requests) -> msg => match msg {
                Ok(()) => flush(Trigger::Threshold),
                Err(_) => return,
            },
            default(wait) => {
                flush(Trigger::Interval);
                next_tick = Instant::now().checked_add(interval);
            }
        }
    }
}

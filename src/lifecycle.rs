use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::amqp::AmqpPane;
use crate::subscriber::Subscriber;

const DRAIN_POLL_ATTEMPTS: u32 = 5;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The two process-wide flags from the data model. Both are write-once:
/// `false -> true` is the only legal transition, enforced by `compare_exchange`.
#[derive(Default)]
pub struct ShutdownFlags {
    pending: AtomicBool,
    error: AtomicBool,
}

impl ShutdownFlags {
    pub fn pending_shutdown(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn error_shutdown(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Returns `true` the first time it is called; subsequent calls are a
    /// no-op that return `false`, so callers can tell whether they own the
    /// transition.
    fn set_pending(&self) -> bool {
        self.pending.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn set_error(&self) -> bool {
        self.error.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    /// Force `pendingShutdown` true without running the rest of the drain
    /// sequence, for exercising the HTTP router's shutdown-rejection
    /// middleware in isolation.
    #[cfg(any(test, feature = "test-support"))]
    pub fn force_pending(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }
}

/// Coordinates graceful and error-triggered shutdown across the AMQP pane,
/// the subscriber fleet, and the HTTP server.
pub struct LifecycleCoordinator {
    flags: Arc<ShutdownFlags>,
    subscribers: Vec<Arc<Subscriber>>,
    shutdown_notify: Arc<Notify>,
}

impl LifecycleCoordinator {
    pub fn new(flags: Arc<ShutdownFlags>, subscribers: Vec<Arc<Subscriber>>) -> Self {
        Self { flags, subscribers, shutdown_notify: Arc::new(Notify::new()) }
    }

    pub fn flags(&self) -> Arc<ShutdownFlags> {
        self.flags.clone()
    }

    /// Resolves once a shutdown (graceful or error) has been initiated, so
    /// the HTTP server task can stop accepting connections.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown_notify.clone()
    }

    /// Drive the graceful-shutdown sequence from spec.md §4.6 step 1-6,
    /// then close the AMQP pane. Idempotent: a second call after
    /// `errorShutdown` already ran is a no-op.
    pub async fn graceful_shutdown(&self, pane: &AmqpPane) {
        if !self.flags.set_pending() {
            return;
        }

        info!("graceful shutdown initiated");
        self.shutdown_notify.notify_waiters();

        for subscriber in &self.subscribers {
            subscriber.stop(false).await;
        }

        for attempt in 1..=DRAIN_POLL_ATTEMPTS {
            let total: u64 = self.subscribers.iter().map(|s| s.in_flight_push_requests()).sum();
            if total == 0 {
                break;
            }
            if attempt == DRAIN_POLL_ATTEMPTS {
                warn!(in_flight = total, "drain budget exhausted, shutting down with pushes still in flight");
                break;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }

        if let Err(e) = pane.close().await {
            warn!(error = %e, "error while closing AMQP pane during graceful shutdown");
        }
    }

    /// Drive the unexpected-close handler from spec.md §4.6: a channel or
    /// connection closed while not already draining. Idempotent against a
    /// graceful shutdown already in progress.
    pub async fn error_shutdown(&self, pane: &AmqpPane, reason: &str) {
        if !self.flags.set_error() {
            return;
        }
        self.flags.set_pending();

        error!(reason, "AMQP resource closed unexpectedly, entering error shutdown");
        self.shutdown_notify.notify_waiters();

        for subscriber in &self.subscribers {
            subscriber.stop(true).await;
        }

        if let Err(e) = pane.close().await {
            warn!(error = %e, "error while closing AMQP pane during error shutdown");
        }
    }
}

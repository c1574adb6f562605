//! Busy/free back-pressure notification to the upstream trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lib::comms::DynSender;
use lib::types::{RunNumber, TriggerInhibit};
use tokio::sync::Mutex;
use tracing::debug;

use crate::issues::{self, Issue};

/// Single writer for the inhibit line.
///
/// The mutex spans both the aggregate-busy evaluation and the send, so the
/// transmitted value always matches the state it was computed from and the
/// observable sequence of inhibits is linearized. The last transmitted
/// value itself stays atomic so it can be reset and inspected outside the
/// notify window.
pub struct InhibitNotifier {
    sender: DynSender<TriggerInhibit>,
    notify_mutex: Mutex<()>,
    last_notified_busy: AtomicBool,
}

impl InhibitNotifier {
    pub fn new(sender: DynSender<TriggerInhibit>) -> Self {
        Self {
            sender,
            notify_mutex: Mutex::new(()),
            last_notified_busy: AtomicBool::new(false),
        }
    }

    pub fn sender(&self) -> &DynSender<TriggerInhibit> {
        &self.sender
    }

    /// A new run starts with the trigger assumed uninhibited.
    pub fn reset(&self) {
        self.last_notified_busy.store(false, Ordering::SeqCst);
    }

    /// Evaluates `aggregate_busy` under the inhibit lock and transmits the
    /// value if it differs from the last one sent. Transmission is retried
    /// while `running` holds; each failed attempt is only a warning.
    pub async fn notify_if_needed<F>(
        &self,
        aggregate_busy: F,
        run_number: RunNumber,
        running: &AtomicBool,
        timeout: Duration,
    ) where
        F: FnOnce() -> bool,
    {
        let _guard = self.notify_mutex.lock().await;
        let busy = aggregate_busy();
        if busy == self.last_notified_busy.load(Ordering::SeqCst) {
            return;
        }

        loop {
            let message = TriggerInhibit { busy, run_number };
            match self.sender.send(message, timeout).await {
                Ok(()) => {
                    debug!(busy, run_number, "Sent busy state to the trigger");
                    break;
                }
                Err(source) => {
                    issues::report(&Issue::OperationFailed {
                        target: self.sender.name().to_owned(),
                        source,
                    });
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        self.last_notified_busy.store(busy, Ordering::SeqCst);
    }
}

//! Per-execution context carrying cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Context threaded through every runner call of one execution.
///
/// Clones share the same cancellation state, so a caller can keep a clone
/// and cancel an execution running elsewhere.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    label: Option<Arc<str>>,
    state: Arc<CancelState>,
}

impl ExecutionContext {
    /// Create a new context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a label used in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(Arc::from(label.into()));
        self
    }

    /// The context label, or `-` if none was set.
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("-")
    }

    /// Cancel the execution. Idempotent.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Check if the execution was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the execution is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // register before checking the flag so a concurrent cancel is not missed
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

//! Cooperative cancellation for runs and stage attempts.
//!
//! Each run owns a [`CancellationTokenSource`]; `stop` cancels it. Every agent
//! invocation receives a [`ChildToken`] derived from the run token, so an
//! invocation observes both a run-wide stop and its own abort (timeout or
//! explicit `abort`).
//!
//! # Example
//!
//! ```ignore
//! let source = CancellationTokenSource::new();
//! let attempt = source.child_token();
//!
//! tokio::select! {
//!     _ = attempt.cancelled() => { /* abort the agent */ }
//!     output = invoke() => { /* use output */ }
//! }
//!
//! source.cancel(); // reaches every child
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared cancellation flag.
///
/// Clones share state; cancelling through any owner is visible to all.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Returns true once the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Completes when the token is cancelled (immediately if it already is).
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }
}

/// Owner of a run-level token.
#[derive(Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl CancellationTokenSource {
    /// Creates a source with a fresh, non-cancelled token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Returns a clone of the source's token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the token and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Derives a child token for a single invocation.
    pub fn child_token(&self) -> ChildToken {
        ChildToken::new(self.token.clone())
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Token scoped to one agent invocation.
///
/// Cancelled when its parent is cancelled or when [`cancel`](Self::cancel) is
/// called on it directly. Cancelling a child never affects the parent.
#[derive(Clone, Debug)]
pub struct ChildToken {
    parent: CancellationToken,
    local: CancellationToken,
}

impl ChildToken {
    fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            local: CancellationToken::new(),
        }
    }

    /// True if either this token or its parent was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.local.is_cancelled() || self.parent.is_cancelled()
    }

    /// True if the parent (run) was cancelled.
    pub fn is_parent_cancelled(&self) -> bool {
        self.parent.is_cancelled()
    }

    /// Cancels only this invocation.
    pub fn cancel(&self) {
        self.local.cancel();
    }

    /// Completes when this token or its parent is cancelled.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.local.cancelled() => {}
            _ = self.parent.cancelled() => {}
        }
    }
}

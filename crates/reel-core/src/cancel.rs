// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cancellation primitives for build runs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl TokenInner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

/// A cloneable, cheaply-shareable token used to signal cancellation.
///
/// All clones share the same underlying state; cancelling one immediately
/// makes every clone observe `is_cancelled() == true`. A derived child token
/// (see [`child`](Self::child)) observes its parent's cancellation but never
/// propagates its own upward, so the executor can stop a single job without
/// stopping the run.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
    parent: Option<Arc<TokenInner>>,
}

impl CancellationToken {
    /// Create a new root token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new()),
            parent: None,
        }
    }

    /// Derive a child token. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner::new()),
            // Children observe the root: grandchildren collapse onto the
            // same ancestor so the chain never grows.
            parent: Some(
                self.parent
                    .clone()
                    .unwrap_or_else(|| Arc::clone(&self.inner)),
            ),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` if this token or its parent has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.cancelled.load(Ordering::SeqCst))
    }

    /// Returns a future that completes when the token is cancelled.
    ///
    /// Resolves immediately if already cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        () = self.inner.notify.notified() => {}
                        () = parent.notify.notified() => {}
                    }
                }
                None => self.inner.notify.notified().await,
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// The user explicitly requested cancellation.
    UserRequested,
    /// A deadline or timeout expired.
    Timeout,
    /// The failure policy halted the run at a layer barrier.
    FailurePolicy,
    /// The host system is shutting down.
    SystemShutdown,
}

impl CancellationReason {
    /// Human-readable description of the reason.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::UserRequested => "cancelled by user request",
            Self::Timeout => "cancelled due to timeout",
            Self::FailurePolicy => "halted by the failure policy",
            Self::SystemShutdown => "cancelled because the system is shutting down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_flips_state_and_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn parent_cancel_reaches_children() {
        let root = CancellationToken::new();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let root = CancellationToken::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn grandchildren_observe_the_root() {
        let root = CancellationToken::new();
        let grandchild = root.child().child();
        root.cancel();
        assert!(grandchild.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[test]
    fn all_reasons_have_descriptions() {
        for r in [
            CancellationReason::UserRequested,
            CancellationReason::Timeout,
            CancellationReason::FailurePolicy,
            CancellationReason::SystemShutdown,
        ] {
            assert!(!r.description().is_empty(), "{r:?} has empty description");
        }
    }
}

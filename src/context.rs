//! Per-call cancellation context.
//!
//! Every store call, lock acquisition and delivery takes a [`CallContext`].
//! A context is "done" once its cancellation token fires or its deadline
//! passes, whichever comes first. Backends race their I/O against
//! [`CallContext::done`] so a caller's deadline bounds total latency,
//! including lock retries.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation signal plus optional deadline, cloned into every call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never done unless explicitly cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Wrap an externally owned cancellation token.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Child context: cancelled with the parent, optionally with a tighter deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fire the cancellation signal for this context and all its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or the deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Drive `fut` unless the context finishes first. `None` means cancelled.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_done() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.done() => None,
            out = fut => Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_before_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { 7 }).await, Some(7));
        assert!(!ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_slow_future() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let out = ctx
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert!(out.is_none());
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_child() {
        let parent = CallContext::new();
        let child = parent.child(None);
        assert!(!child.is_done());

        parent.cancel();
        assert!(child.is_done());
        assert!(child.run(async { 1 }).await.is_none());
    }

    #[test]
    fn test_child_keeps_tighter_deadline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let parent = CallContext::with_timeout(Duration::from_secs(1));
            let child = parent.child(Some(Duration::from_secs(30)));
            assert_eq!(child.deadline(), parent.deadline());
        });
    }
}

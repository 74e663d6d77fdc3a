//! Cancellation plumbing.
//!
//! Requests run under a tree of cancellation tokens: the engine root, a
//! per-request parent (which may also observe a caller-supplied token), and
//! a per-attempt child when `attempt_timeout` is configured. Propagation is
//! strictly one-way: cancelling a parent cancels every child; cancelling a
//! child never touches its parent. Each cancellation carries an
//! [`AbortReason`] so the pipeline can attribute `timed_out` to the timer
//! that actually fired.

use futures::future::BoxFuture;
use tokio::sync::watch;

/// Which timer armed an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The whole-operation budget; nothing survives it.
    Total,
    /// One attempt's budget; the retry loop may continue.
    Attempt,
}

/// Why a token was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// User-invoked abort, with an optional caller-supplied reason.
    User(Option<String>),
    /// A timeout timer fired.
    Timer(TimerKind),
    /// The engine was destroyed.
    EngineDestroyed,
}

impl AbortReason {
    pub fn is_timer(&self) -> bool {
        matches!(self, AbortReason::Timer(_))
    }
}

/// The cancelling half: owns the ability to fire a token.
#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: watch::Sender<Option<AbortReason>>,
    token: CancelToken,
}

/// The observing half. Cheap to clone; observes its own source and every
/// ancestor in the parent chain.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<AbortReason>>,
    parents: Vec<CancelToken>,
}

impl CancelSource {
    /// A root source with no parents.
    pub fn new() -> Self {
        Self::with_parents(Vec::new())
    }

    /// A source whose token also observes `parents`.
    pub fn with_parents(parents: Vec<CancelToken>) -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx, token: CancelToken { rx, parents } }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Fire the token. The first reason wins; returns whether this call set
    /// it.
    pub fn cancel(&self, reason: AbortReason) -> bool {
        let mut set = false;
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                set = true;
                true
            } else {
                false
            }
        });
        set
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A child source: its token observes `self` in addition to itself.
    pub fn child_source(&self) -> CancelSource {
        CancelSource::with_parents(vec![self.clone()])
    }

    /// Cancelled directly or through any ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// The effective reason: this token's own first, then the ancestors'.
    pub fn reason(&self) -> Option<AbortReason> {
        if let Some(reason) = self.rx.borrow().clone() {
            return Some(reason);
        }
        self.parents.iter().find_map(|p| p.reason())
    }

    /// Resolves when this token (or any ancestor) is cancelled. Never
    /// resolves if every source is dropped uncancelled. Boxed so the parent
    /// chain can recurse.
    pub fn cancelled(&self) -> BoxFuture<'_, AbortReason> {
        Box::pin(async move {
            if let Some(reason) = self.reason() {
                return reason;
            }

            let mut waits: Vec<BoxFuture<'_, AbortReason>> =
                Vec::with_capacity(1 + self.parents.len());
            waits.push(Box::pin(Self::wait_own(self.rx.clone())));
            for parent in &self.parents {
                waits.push(parent.cancelled());
            }
            let (reason, _, _) = futures::future::select_all(waits).await;
            reason
        })
    }

    async fn wait_own(mut rx: watch::Receiver<Option<AbortReason>>) -> AbortReason {
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Source dropped without firing: this leg never resolves.
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_fires_token_with_reason() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        assert!(source.cancel(AbortReason::User(Some("stop".into()))));
        assert_eq!(token.reason(), Some(AbortReason::User(Some("stop".into()))));
        assert_eq!(token.cancelled().await, AbortReason::User(Some("stop".into())));
    }

    #[tokio::test]
    async fn first_reason_wins() {
        let source = CancelSource::new();
        assert!(source.cancel(AbortReason::Timer(TimerKind::Total)));
        assert!(!source.cancel(AbortReason::User(None)));
        assert_eq!(source.token().reason(), Some(AbortReason::Timer(TimerKind::Total)));
    }

    #[tokio::test]
    async fn parent_cancel_propagates_to_child() {
        let parent = CancelSource::new();
        let child = parent.token().child_source();
        let child_token = child.token();

        parent.cancel(AbortReason::Timer(TimerKind::Total));
        assert!(child_token.is_cancelled());
        assert_eq!(child_token.cancelled().await, AbortReason::Timer(TimerKind::Total));
    }

    #[tokio::test]
    async fn child_cancel_does_not_propagate_up() {
        let parent = CancelSource::new();
        let child = parent.token().child_source();

        child.cancel(AbortReason::Timer(TimerKind::Attempt));
        assert!(child.token().is_cancelled());
        assert!(!parent.token().is_cancelled());
    }

    #[tokio::test]
    async fn extra_parents_are_observed() {
        let engine = CancelSource::new();
        let external = CancelSource::new();
        let request =
            CancelSource::with_parents(vec![engine.token(), external.token()]);
        let token = request.token();

        external.cancel(AbortReason::User(None));
        assert_eq!(token.reason(), Some(AbortReason::User(None)));
    }

    #[tokio::test]
    async fn pending_token_does_not_resolve() {
        let source = CancelSource::new();
        let token = source.token();
        let wait = tokio::time::timeout(Duration::from_millis(10), token.cancelled());
        assert!(wait.await.is_err());
    }

    #[tokio::test]
    async fn waiting_task_wakes_on_cancel() {
        let source = CancelSource::new();
        let token = source.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });

        tokio::task::yield_now().await;
        source.cancel(AbortReason::EngineDestroyed);
        assert_eq!(waiter.await.unwrap(), AbortReason::EngineDestroyed);
    }
}

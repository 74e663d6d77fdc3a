//! The value returned by `request`: a future plus cancellation controls.
//!
//! The pipeline itself runs as a spawned task, so a request makes progress
//! whether or not the caller is awaiting the handle. Aborting fires the
//! request's parent cancellation token; the task observes it at its next
//! suspension point and settles with a 499 error.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::task::JoinHandle;

use crate::cancel::{AbortReason, CancelSource};
use crate::error::{FetchError, Step, STATUS_UNCLASSIFIED};
use crate::method::Method;
use crate::response::FetchResponse;

/// Cloneable cancellation control detached from the handle, so a request can
/// be aborted while another task awaits it.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    source: CancelSource,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.source.cancel(AbortReason::User(None));
    }

    pub fn abort_with(&self, reason: impl Into<String>) {
        self.source.cancel(AbortReason::User(Some(reason.into())));
    }

    pub fn is_aborted(&self) -> bool {
        self.source.is_cancelled()
    }
}

/// A running request. Await it for the outcome; abort it to cancel.
#[pin_project]
pub struct FetchHandle {
    #[pin]
    task: JoinHandle<Result<FetchResponse, FetchError>>,
    source: CancelSource,
    method: Method,
    path: String,
}

impl FetchHandle {
    pub(crate) fn new(
        task: JoinHandle<Result<FetchResponse, FetchError>>,
        source: CancelSource,
        method: Method,
        path: String,
    ) -> Self {
        Self { task, source, method, path }
    }

    /// Cancel the request. The settled error has `status = 499`,
    /// `aborted = true`, `timed_out = false`.
    pub fn abort(&self) {
        self.source.cancel(AbortReason::User(None));
    }

    /// Cancel with a caller-supplied reason string.
    pub fn abort_with(&self, reason: impl Into<String>) {
        self.source.cancel(AbortReason::User(Some(reason.into())));
    }

    /// Whether the request has settled (either way).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Whether the request's parent token has fired (user abort, timer, or
    /// engine destruction).
    pub fn is_aborted(&self) -> bool {
        self.source.is_cancelled()
    }

    /// Detached cancellation control.
    pub fn aborter(&self) -> AbortHandle {
        AbortHandle { source: self.source.clone() }
    }
}

impl Future for FetchHandle {
    type Output = Result<FetchResponse, FetchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.task.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The pipeline task never panics by design; if it is torn down
            // anyway (runtime shutdown), surface an unclassified error.
            Poll::Ready(Err(join_error)) => Poll::Ready(Err(FetchError::new(
                *this.method,
                this.path,
                "",
                STATUS_UNCLASSIFIED,
                Step::Response,
            )
            .with_message(format!("request task failed: {join_error}")))),
        }
    }
}

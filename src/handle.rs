//! Shared, single-assignment result handle for a job.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::JobError;

/// Sending half of a job's settlement.
pub(crate) type Settlement<O> = oneshot::Sender<Result<O, JobError>>;

/// Awaitable result of a submitted job.
///
/// Clones observe the same settlement, which is how duplicate submissions
/// share one execution and one result.
pub struct JobHandle<O> {
    id: Uuid,
    inner: Shared<BoxFuture<'static, Result<O, JobError>>>,
}

impl<O> JobHandle<O>
where
    O: Clone + Send + Sync + 'static,
{
    /// Create an unsettled handle together with the sender that settles it.
    pub(crate) fn channel(id: Uuid) -> (Settlement<O>, Self) {
        let (tx, rx) = oneshot::channel();
        let inner = async move {
            rx.await
                .unwrap_or_else(|_| Err(JobError::aborted("job dropped before settling")))
        }
        .boxed()
        .shared();
        (tx, Self { id, inner })
    }

    /// Id of the job that owns this handle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The settled result, if the handle has already been awaited to
    /// completion by any clone.
    pub fn peek(&self) -> Option<&Result<O, JobError>> {
        self.inner.peek()
    }

    pub fn is_settled(&self) -> bool {
        self.peek().is_some()
    }
}

impl<O> Clone for JobHandle<O>
where
    O: Clone,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: self.inner.clone(),
        }
    }
}

impl<O> Future for JobHandle<O>
where
    O: Clone,
{
    type Output = Result<O, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_unpin(cx)
    }
}

impl<O> std::fmt::Debug for JobHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

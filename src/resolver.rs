//! Resolver trait — the user-supplied function a pool schedules.

use std::future::Future;

use async_trait::async_trait;

use crate::error::JobError;
use crate::worker::JobContext;

/// Asynchronously resolves one input into an output.
///
/// The context carries the attempt's cancellation signal and the `spawn`
/// capability for scheduling child inputs through the same pool.
#[async_trait]
pub trait Resolver<I, O>: Send + Sync + 'static {
    async fn resolve(&self, input: I, ctx: JobContext<I, O>) -> Result<O, JobError>;
}

#[async_trait]
impl<I, O, F, Fut> Resolver<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, JobContext<I, O>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, JobError>> + Send + 'static,
{
    async fn resolve(&self, input: I, ctx: JobContext<I, O>) -> Result<O, JobError> {
        (self)(input, ctx).await
    }
}

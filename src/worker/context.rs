//! Per-attempt job context handed to resolvers.
//!
//! The context is an explicit argument rather than ambient state, so it is
//! only reachable from the invocation it was built for. Spawning through a
//! context whose attempt has finished fails with [`JobError::NoContext`].

use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::JobError;
use crate::pool::PoolInner;
use crate::worker::scheduler::{Placement, SlotLease};

/// Cancellation signal and spawn capability of one job attempt.
pub struct JobContext<I, O> {
    job_id: Uuid,
    attempt: u32,
    /// Attempt signal; cancelled on timeout, job failure or pool abort.
    signal: CancellationToken,
    /// Job signal that spawned children are chained to.
    lineage: CancellationToken,
    lease: Arc<SlotLease>,
    pool: Weak<PoolInner<I, O>>,
}

impl<I, O> JobContext<I, O> {
    pub(crate) fn new(
        job_id: Uuid,
        attempt: u32,
        signal: CancellationToken,
        lineage: CancellationToken,
        lease: Arc<SlotLease>,
        pool: Weak<PoolInner<I, O>>,
    ) -> Self {
        Self {
            job_id,
            attempt,
            signal,
            lineage,
            lease,
            pool,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cancellation signal resolvers should observe cooperatively.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Completes once this attempt has been cancelled.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }
}

impl<I, O> JobContext<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Schedule `input` through the same pool and await its result.
    ///
    /// The child shares the pool's cache and concurrency cap and is queued
    /// ahead of previously submitted jobs. While the child is pending this
    /// job gives up its concurrency slot.
    pub async fn spawn(&self, input: I) -> Result<O, JobError> {
        if self.lease.is_closed() {
            return Err(JobError::NoContext);
        }
        let pool = self.pool.upgrade().ok_or(JobError::NoContext)?;
        let handle = pool.enqueue(input, Placement::Front, &self.lineage);
        drop(pool);

        if let Some(result) = handle.peek() {
            return result.clone();
        }

        debug!(job_id = %self.job_id, child_id = %handle.id(), "Awaiting spawned job");
        let yielded = self.lease.yield_slot();
        let result = handle.await;
        yielded.reclaim().await;
        result
    }

    /// Spawn every input concurrently; results keep input order.
    pub async fn spawn_many<It>(&self, inputs: It) -> Vec<Result<O, JobError>>
    where
        It: IntoIterator<Item = I>,
    {
        join_all(inputs.into_iter().map(|input| self.spawn(input))).await
    }

    /// Escalate to the shared signal, aborting the whole pool.
    pub fn abort_pool(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.abort(&format!("escalated by job {}", self.job_id));
        }
    }
}

impl<I, O> Clone for JobContext<I, O> {
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id,
            attempt: self.attempt,
            signal: self.signal.clone(),
            lineage: self.lineage.clone(),
            lease: Arc::clone(&self.lease),
            pool: self.pool.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for JobContext<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.signal.is_cancelled())
            .finish()
    }
}

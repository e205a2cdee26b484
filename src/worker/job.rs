//! Job — one input, its resolver and its retry/timeout/backoff state.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::JobError;
use crate::handle::{JobHandle, Settlement};
use crate::pool::PoolInner;
use crate::resolver::Resolver;
use crate::worker::context::JobContext;
use crate::worker::scheduler::{Availability, Execution, Schedulable, SlotLease};
use crate::worker::state::JobState;

/// Retry, timeout and backoff settings applied to every attempt of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RetryPolicy {
    pub retry: u32,
    pub timeout: Option<Duration>,
    pub delay: Duration,
}

impl From<&PoolConfig> for RetryPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            retry: config.retry,
            timeout: config.timeout,
            delay: config.delay,
        }
    }
}

struct JobInner {
    state: JobState,
    attempts: u32,
    attempts_remaining: u32,
    /// `None` means runnable immediately.
    earliest_run: Option<Instant>,
}

/// Execution unit tracked by the scheduler.
pub(crate) struct Job<I, O> {
    id: Uuid,
    input: I,
    resolver: Arc<dyn Resolver<I, O>>,
    policy: RetryPolicy,
    /// Aborted on pool abort or terminal failure; children chain onto it.
    signal: CancellationToken,
    pool: Weak<PoolInner<I, O>>,
    inner: Mutex<JobInner>,
    settlement: Mutex<Option<Settlement<O>>>,
}

impl<I, O> Job<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        input: I,
        resolver: Arc<dyn Resolver<I, O>>,
        policy: RetryPolicy,
        signal: CancellationToken,
        pool: Weak<PoolInner<I, O>>,
    ) -> (Arc<Self>, JobHandle<O>) {
        let id = Uuid::new_v4();
        let (settlement, handle) = JobHandle::channel(id);
        let job = Arc::new(Self {
            id,
            input,
            resolver,
            policy,
            signal,
            pool,
            inner: Mutex::new(JobInner {
                state: JobState::Idle,
                attempts: 0,
                attempts_remaining: policy.retry,
                earliest_run: None,
            }),
            settlement: Mutex::new(Some(settlement)),
        });
        (job, handle)
    }

    pub(crate) fn input(&self) -> &I {
        &self.input
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> JobState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(inner: &mut JobInner, target: JobState) {
        debug_assert!(
            inner.state.can_transition_to(target),
            "invalid job transition {} -> {}",
            inner.state,
            target
        );
        inner.state = target;
    }

    /// Deliver the one and only result.
    fn settle(&self, result: Result<O, JobError>) {
        let sender = self
            .settlement
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            // Every handle may already be gone; nothing to deliver to then.
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(job_id = %self.id, "Job settled twice, ignoring"),
        }
    }

    async fn run_attempt(self: Arc<Self>, lease: Arc<SlotLease>) -> Execution {
        let attempt = {
            let mut inner = self.lock();
            Self::transition(&mut inner, JobState::Running);
            inner.attempts += 1;
            inner.attempts
        };

        let result = if self.signal.is_cancelled() {
            Err(JobError::aborted("job cancelled before start"))
        } else {
            let attempt_signal = self.signal.child_token();
            let ctx = JobContext::new(
                self.id,
                attempt,
                attempt_signal.clone(),
                self.signal.clone(),
                Arc::clone(&lease),
                self.pool.clone(),
            );
            let held = lease.hold(self.resolver.resolve(self.input.clone(), ctx));
            let call = AssertUnwindSafe(held)
                .catch_unwind()
                .map(|outcome| {
                    outcome.unwrap_or_else(|_| Err(JobError::upstream("resolver panicked")))
                });

            tokio::select! {
                biased;
                _ = self.signal.cancelled() => Err(JobError::aborted("job cancelled")),
                result = bounded(call, self.policy.timeout, &attempt_signal) => result,
            }
        };

        self.conclude(attempt, result)
    }

    fn conclude(&self, attempt: u32, result: Result<O, JobError>) -> Execution {
        let err = match result {
            Ok(value) => {
                Self::transition(&mut self.lock(), JobState::Settled);
                debug!(job_id = %self.id, attempt, "Job resolved");
                self.settle(Ok(value));
                return Execution::Settled;
            }
            Err(err) => err,
        };

        let retrying = {
            let mut inner = self.lock();
            if err.is_retryable() && inner.attempts_remaining > 0 {
                inner.attempts_remaining -= 1;
                inner.earliest_run =
                    (!self.policy.delay.is_zero()).then(|| Instant::now() + self.policy.delay);
                Self::transition(&mut inner, JobState::Idle);
                true
            } else {
                Self::transition(&mut inner, JobState::Settled);
                false
            }
        };

        if retrying {
            debug!(
                job_id = %self.id,
                attempt,
                kind = ?err.kind(),
                delay_ms = self.policy.delay.as_millis() as u64,
                error = %err,
                "Job attempt failed, retrying"
            );
            return Execution::Retry;
        }

        warn!(job_id = %self.id, attempt, kind = ?err.kind(), error = %err, "Job failed");
        // Children spawned by this job observe the failure as an abort.
        self.signal.cancel();
        self.settle(Err(err));
        Execution::Settled
    }
}

/// Race an attempt against its timeout, cancelling the attempt signal if the
/// timer wins.
async fn bounded<T, F>(
    call: F,
    timeout: Option<Duration>,
    signal: &CancellationToken,
) -> Result<T, JobError>
where
    F: Future<Output = Result<T, JobError>>,
{
    let Some(timeout) = timeout else {
        return call.await;
    };
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            signal.cancel();
            Err(JobError::Timeout { timeout })
        }
    }
}

impl<I, O> Schedulable for Job<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn id(&self) -> Uuid {
        self.id
    }

    fn availability(&self) -> Availability {
        let inner = self.lock();
        match inner.state {
            JobState::Idle => inner.earliest_run.map_or(Availability::Now, Availability::At),
            JobState::Running | JobState::Settled => Availability::Never,
        }
    }

    fn execute(self: Arc<Self>, lease: Arc<SlotLease>) -> BoxFuture<'static, Execution> {
        self.run_attempt(lease).boxed()
    }

    fn abort(&self, reason: &str) {
        {
            let mut inner = self.lock();
            if inner.state != JobState::Idle {
                return;
            }
            Self::transition(&mut inner, JobState::Settled);
        }
        debug!(job_id = %self.id, reason, "Queued job aborted");
        self.signal.cancel();
        self.settle(Err(JobError::aborted(reason)));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::FailureKind;
    use crate::worker::scheduler::{Placement, Scheduler};

    fn scheduler() -> Arc<Scheduler> {
        Scheduler::new(None, Duration::ZERO, CancellationToken::new())
    }

    fn job<F, Fut>(
        f: F,
        policy: RetryPolicy,
        signal: CancellationToken,
    ) -> (Arc<Job<u32, u32>>, JobHandle<u32>)
    where
        F: Fn(u32, JobContext<u32, u32>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u32, JobError>> + Send + 'static,
    {
        Job::new(7, Arc::new(f), policy, signal, Weak::new())
    }

    fn echo(signal: CancellationToken) -> (Arc<Job<u32, u32>>, JobHandle<u32>) {
        job(|n, _| async move { Ok(n) }, RetryPolicy::default(), signal)
    }

    #[test]
    fn policy_from_config() {
        let config = PoolConfig::default()
            .with_retry(2)
            .with_delay(Duration::from_millis(5))
            .with_timeout(Duration::from_secs(1));
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.retry, 2);
        assert_eq!(policy.delay, Duration::from_millis(5));
        assert_eq!(policy.timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn new_job_is_immediately_available() {
        let (job, _handle) = echo(CancellationToken::new());
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(job.availability(), Availability::Now);
        assert_eq!(*job.input(), 7);
    }

    #[tokio::test]
    async fn resolves_through_scheduler() {
        let scheduler = scheduler();
        let (job, handle) = job(
            |n, _| async move { Ok(n * 2) },
            RetryPolicy::default(),
            scheduler.signal().child_token(),
        );
        scheduler.admit(job.clone(), Placement::Back);

        assert_eq!(handle.await.unwrap(), 14);
        assert_eq!(job.state(), JobState::Settled);
        assert_eq!(job.availability(), Availability::Never);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sets_backoff_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let scheduler = scheduler();
        let policy = RetryPolicy {
            retry: 1,
            timeout: None,
            delay: Duration::from_millis(40),
        };
        let (job, handle) = job(
            move |n, _| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(JobError::upstream("first attempt fails"))
                    } else {
                        Ok(n)
                    }
                }
            },
            policy,
            scheduler.signal().child_token(),
        );
        let submitted = Instant::now();
        scheduler.admit(job.clone(), Placement::Back);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(job.state(), JobState::Idle);
        let earliest = submitted + Duration::from_millis(40);
        assert!(matches!(job.availability(), Availability::At(at) if at >= earliest));

        assert_eq!(handle.await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(Instant::now() - submitted >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn abort_is_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let scheduler = scheduler();
        let policy = RetryPolicy {
            retry: 3,
            ..RetryPolicy::default()
        };
        let (job, handle) = job(
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(JobError::aborted("caller gave up")) }
            },
            policy,
            scheduler.signal().child_token(),
        );
        scheduler.admit(job, Placement::Back);

        let err = handle.await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Abort);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_resolver_surfaces_as_upstream() {
        let scheduler = scheduler();
        let (job, handle) = job(
            |n, _| async move {
                if n == 7 {
                    panic!("bad input");
                }
                Ok(n)
            },
            RetryPolicy::default(),
            scheduler.signal().child_token(),
        );
        scheduler.admit(job, Placement::Back);

        let err = handle.await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Upstream);
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn queued_abort_settles_idle_job_once() {
        let (job, handle) = echo(CancellationToken::new());
        job.abort("shutting down");
        job.abort("again");

        let err = handle.await.unwrap_err();
        assert!(err.to_string().contains("shutting down"));
        assert_eq!(job.state(), JobState::Settled);
        assert!(job.signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_signal_aborts_before_running() {
        let signal = CancellationToken::new();
        let scheduler = scheduler();
        let (job, handle) = echo(signal.clone());
        signal.cancel();
        scheduler.admit(job, Placement::Back);

        assert_eq!(handle.await.unwrap_err().kind(), FailureKind::Abort);
    }
}

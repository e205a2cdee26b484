//! JobPool — the public facade over one scheduler and one optional cache.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ResolverCache;
use crate::config::PoolConfig;
use crate::error::{JobError, Result};
use crate::handle::JobHandle;
use crate::resolver::Resolver;
use crate::worker::context::JobContext;
use crate::worker::job::{Job, RetryPolicy};
use crate::worker::scheduler::{Placement, PoolStats, Scheduler};

/// State shared by every clone of a pool and weakly by its jobs.
pub(crate) struct PoolInner<I, O> {
    resolver: Arc<dyn Resolver<I, O>>,
    config: PoolConfig,
    policy: RetryPolicy,
    scheduler: Arc<Scheduler>,
    cache: Option<Arc<dyn ResolverCache<I, O>>>,
    /// Makes cache lookup, job construction and cache store one step.
    submit_lock: Mutex<()>,
    watcher: Option<JoinHandle<()>>,
    this: Weak<PoolInner<I, O>>,
}

impl<I, O> PoolInner<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Look `input` up in the cache, or build a job for it and admit it.
    pub(crate) fn enqueue(
        &self,
        input: I,
        placement: Placement,
        parent: &CancellationToken,
    ) -> JobHandle<O> {
        let (job, handle) = {
            let _guard = self
                .submit_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(handle) = self.cache.as_ref().and_then(|cache| cache.get(&input)) {
                debug!(job_id = %handle.id(), "Cache hit, sharing existing job");
                return handle;
            }

            let (job, handle) = Job::new(
                input,
                Arc::clone(&self.resolver),
                self.policy,
                parent.child_token(),
                self.this.clone(),
            );
            if let Some(cache) = &self.cache {
                cache.set(job.input(), handle.clone());
            }
            (job, handle)
        };

        self.scheduler.admit(job, placement);
        handle
    }
}

impl<I, O> PoolInner<I, O> {
    pub(crate) fn abort(&self, reason: &str) {
        self.scheduler.abort(reason);
    }
}

impl<I, O> Drop for PoolInner<I, O> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Concurrency-limited, retrying, deduplicating job pool.
///
/// Cloning is cheap; clones share the same queue, cache and signal.
pub struct JobPool<I, O> {
    inner: Arc<PoolInner<I, O>>,
}

impl<I, O> JobPool<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Pool without a cache, driven by `config`.
    pub fn new<R>(resolver: R, config: PoolConfig) -> Result<Self>
    where
        R: Resolver<I, O>,
    {
        Self::builder(resolver).config(config).build()
    }

    /// Same as [`JobPool::new`], with closure signatures inferred from the
    /// pool's input and output types.
    pub fn from_fn<F, Fut>(f: F, config: PoolConfig) -> Result<Self>
    where
        F: Fn(I, JobContext<I, O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, JobError>> + Send + 'static,
    {
        Self::new(f, config)
    }

    pub fn builder<R>(resolver: R) -> JobPoolBuilder<I, O>
    where
        R: Resolver<I, O>,
    {
        JobPoolBuilder {
            resolver: Arc::new(resolver),
            config: PoolConfig::default(),
            cache: None,
            signal: None,
        }
    }

    /// Submit one input. Duplicate inputs share the cached handle.
    pub fn submit(&self, input: I) -> JobHandle<O> {
        let root = self.inner.scheduler.signal();
        self.inner.enqueue(input, Placement::Back, root)
    }

    /// Submit every input; handles keep input order.
    pub fn submit_many<It>(&self, inputs: It) -> Vec<JobHandle<O>>
    where
        It: IntoIterator<Item = I>,
    {
        inputs.into_iter().map(|input| self.submit(input)).collect()
    }

    /// Submit every input and wait for all of them to settle.
    pub async fn resolve_all<It>(&self, inputs: It) -> Vec<std::result::Result<O, JobError>>
    where
        It: IntoIterator<Item = I>,
    {
        join_all(self.submit_many(inputs)).await
    }
}

impl<I, O> JobPool<I, O> {
    /// Jobs that are queued, running, or suspended on spawned children.
    pub fn size(&self) -> usize {
        let stats = self.stats();
        stats.queued + stats.running + stats.suspended
    }

    /// Jobs currently holding a concurrency slot.
    pub fn active(&self) -> usize {
        self.stats().running
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.scheduler.stats()
    }

    /// Abort every queued and running job. The pool rejects later
    /// submissions with an abort failure.
    pub fn abort(&self, reason: &str) {
        self.inner.abort(reason);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.scheduler.is_aborted()
    }

    /// The pool-wide signal every job signal is chained to.
    pub fn signal(&self) -> &CancellationToken {
        self.inner.scheduler.signal()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<I, O> Clone for JobPool<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, O> std::fmt::Debug for JobPool<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .field("cached", &self.inner.cache.is_some())
            .finish()
    }
}

/// Builder for pools that need a cache or an external abort signal.
pub struct JobPoolBuilder<I, O> {
    resolver: Arc<dyn Resolver<I, O>>,
    config: PoolConfig,
    cache: Option<Arc<dyn ResolverCache<I, O>>>,
    signal: Option<CancellationToken>,
}

impl<I, O> JobPoolBuilder<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Deduplicate submissions through `cache`.
    pub fn cache<C>(mut self, cache: Arc<C>) -> Self
    where
        C: ResolverCache<I, O> + 'static,
    {
        self.cache = Some(cache);
        self
    }

    /// Abort the pool when `signal` is cancelled.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn build(self) -> Result<JobPool<I, O>> {
        self.config.validate()?;

        let pool_signal = self
            .signal
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let scheduler = Scheduler::new(self.config.concurrency, self.config.interval, pool_signal);
        let watcher = self
            .signal
            .and_then(|external| watch_external(external, Arc::downgrade(&scheduler)));

        info!(
            concurrency = ?self.config.concurrency,
            interval_ms = self.config.interval.as_millis() as u64,
            retry = self.config.retry,
            timeout_ms = ?self.config.timeout.map(|t| t.as_millis() as u64),
            delay_ms = self.config.delay.as_millis() as u64,
            cached = self.cache.is_some(),
            "Job pool created"
        );

        let policy = RetryPolicy::from(&self.config);
        let inner = Arc::new_cyclic(|this| PoolInner {
            resolver: self.resolver,
            config: self.config,
            policy,
            scheduler,
            cache: self.cache,
            submit_lock: Mutex::new(()),
            watcher,
            this: this.clone(),
        });
        Ok(JobPool { inner })
    }
}

/// Drain the scheduler once the caller's signal fires.
fn watch_external(
    external: CancellationToken,
    scheduler: Weak<Scheduler>,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = Handle::try_current() else {
        warn!("No Tokio runtime, external abort applies on the next scheduler poll");
        return None;
    };
    Some(runtime.spawn(async move {
        external.cancelled().await;
        if let Some(scheduler) = scheduler.upgrade() {
            scheduler.abort("external signal cancelled");
        }
    }))
}

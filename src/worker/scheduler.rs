//! Job scheduler — admission control over a bounded set of running jobs.
//!
//! The scheduler owns queue membership, the slot counter and the throttle
//! timestamp. It never loops waiting for work: every completion, slot release
//! and timer firing calls [`Scheduler::poll`], which starts whatever is
//! runnable now and arms at most one wake timer for whatever becomes runnable
//! later.

use std::collections::VecDeque;
use std::future::{Future, poll_fn};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::ready;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Earliest moment a queued job may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Availability {
    /// Runnable immediately.
    Now,
    /// Runnable once the backoff deadline has passed.
    At(Instant),
    /// Running or settled; never eligible for admission.
    Never,
}

impl Availability {
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        match self {
            Self::Now => true,
            Self::At(at) => *at <= now,
            Self::Never => false,
        }
    }
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Execution {
    /// The job settled and can be forgotten.
    Settled,
    /// A retryable failure; the job goes back into the queue.
    Retry,
}

/// Where an admitted job enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Submitted jobs queue behind their siblings.
    Back,
    /// Spawned children jump ahead so recursive chains finish depth-first.
    Front,
}

/// A unit of work the scheduler can admit.
pub(crate) trait Schedulable: Send + Sync + 'static {
    fn id(&self) -> Uuid;

    fn availability(&self) -> Availability;

    /// Run one attempt. Only called once `availability()` is ready.
    fn execute(self: Arc<Self>, lease: Arc<SlotLease>) -> BoxFuture<'static, Execution>;

    /// Settle a job that will never be started.
    fn abort(&self, reason: &str);
}

/// Point-in-time counters of a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Jobs waiting in the queue (including those backing off).
    pub queued: usize,
    /// Jobs holding a concurrency slot.
    pub running: usize,
    /// Jobs that gave up their slot while awaiting spawned children.
    pub suspended: usize,
}

struct WakeTimer {
    at: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Arc<dyn Schedulable>>,
    running: usize,
    suspended: usize,
    /// Suspended jobs waiting to get a slot back. Served before the queue.
    resumers: VecDeque<oneshot::Sender<SlotGuard>>,
    next_run: Option<Instant>,
    timer: Option<WakeTimer>,
}

/// Concurrency-limited queue poller.
pub(crate) struct Scheduler {
    state: Mutex<SchedulerState>,
    concurrency: Option<usize>,
    interval: Duration,
    signal: CancellationToken,
    this: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a new scheduler. `concurrency: None` means unbounded.
    pub(crate) fn new(
        concurrency: Option<usize>,
        interval: Duration,
        signal: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(SchedulerState::default()),
            concurrency,
            interval,
            signal,
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancellation signal every job signal is chained to.
    pub(crate) fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            queued: state.queue.len(),
            running: state.running,
            suspended: state.suspended,
        }
    }

    /// Abort the scheduler: cancel every job signal and fail whatever is
    /// still queued.
    pub(crate) fn abort(&self, reason: &str) {
        if !self.signal.is_cancelled() {
            info!(reason, "Aborting job scheduler");
        }
        self.signal.cancel();
        self.poll();
    }

    pub(crate) fn admit(&self, job: Arc<dyn Schedulable>, placement: Placement) {
        if self.signal.is_cancelled() {
            job.abort("job pool aborted");
            return;
        }

        {
            let mut state = self.lock();
            debug!(
                job_id = %job.id(),
                ?placement,
                queued = state.queue.len(),
                running = state.running,
                "Admitting job"
            );
            match placement {
                Placement::Back => state.queue.push_back(job),
                Placement::Front => state.queue.push_front(job),
            }
        }

        self.poll();
    }

    /// Re-evaluate admission from scratch.
    pub(crate) fn poll(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let mut starts = Vec::new();
        let mut grants = Vec::new();
        let mut drained = Vec::new();
        {
            let mut state = self.lock();
            let now = Instant::now();
            let aborted = self.signal.is_cancelled();

            if aborted {
                drained.extend(state.queue.drain(..));
            }

            while self.has_free_slot(&state) {
                if let Some(tx) = state.resumers.pop_front() {
                    state.running += 1;
                    grants.push(tx);
                    continue;
                }
                if aborted || state.next_run.is_some_and(|at| at > now) {
                    break;
                }
                let Some(index) = state
                    .queue
                    .iter()
                    .position(|job| job.availability().is_ready(now))
                else {
                    break;
                };
                let Some(job) = state.queue.remove(index) else {
                    break;
                };
                state.running += 1;
                if !self.interval.is_zero() {
                    state.next_run = Some(now + self.interval);
                }
                starts.push(job);
            }

            self.arm_timer(&mut state, now);
        }

        if !drained.is_empty() {
            info!(count = drained.len(), "Failing queued jobs after abort");
        }
        for job in drained {
            job.abort("job pool aborted");
        }
        for tx in grants {
            // A refused grant drops the guard, which hands the slot back.
            if tx.send(SlotGuard::new(Arc::clone(&this))).is_err() {
                trace!("Resume request went away before its slot was granted");
            }
        }
        for job in starts {
            Self::start(&this, job);
        }
    }

    fn has_free_slot(&self, state: &SchedulerState) -> bool {
        self.concurrency.is_none_or(|cap| state.running < cap)
    }

    fn next_wake(&self, state: &SchedulerState, now: Instant) -> Option<Instant> {
        if self.signal.is_cancelled() || !self.has_free_slot(state) {
            return None;
        }
        let earliest = state.queue.iter().map(|job| job.availability()).min()?;
        let at = match earliest {
            Availability::Now => now,
            Availability::At(at) => at,
            Availability::Never => return None,
        };
        Some(state.next_run.map_or(at, |next| next.max(at)))
    }

    /// Keep exactly one timer armed for the next wake-up, or none.
    fn arm_timer(&self, state: &mut SchedulerState, now: Instant) {
        let wake_at = self.next_wake(state, now);
        if let (Some(at), Some(timer)) = (wake_at, state.timer.as_ref()) {
            if timer.at == at {
                return;
            }
        }
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        let Some(at) = wake_at else {
            return;
        };

        let scheduler = self.this.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.wake(at);
            }
        });
        trace!(
            delay_ms = at.saturating_duration_since(now).as_millis() as u64,
            "Wake timer armed"
        );
        state.timer = Some(WakeTimer { at, handle });
    }

    fn wake(&self, at: Instant) {
        {
            let mut state = self.lock();
            if state.timer.as_ref().is_some_and(|timer| timer.at == at) {
                state.timer = None;
            }
        }
        self.poll();
    }

    fn start(this: &Arc<Self>, job: Arc<dyn Schedulable>) {
        let lease = Arc::new(SlotLease::new(
            Arc::clone(this),
            SlotGuard::new(Arc::clone(this)),
        ));
        let scheduler = Arc::clone(this);
        debug!(job_id = %job.id(), "Starting job");

        tokio::spawn(async move {
            let execution = Arc::clone(&job).execute(Arc::clone(&lease)).await;
            let slot = lease.close();
            if execution == Execution::Retry {
                scheduler.requeue(job);
            }
            // Requeue before the slot goes back so the release poll sees it.
            drop(slot);
            scheduler.poll();
        });
    }

    /// Put a job back after a retryable failure, ahead of later arrivals.
    fn requeue(&self, job: Arc<dyn Schedulable>) {
        if self.signal.is_cancelled() {
            job.abort("job pool aborted");
            return;
        }
        let mut state = self.lock();
        state.queue.push_front(job);
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.poll();
    }

    fn park(self: &Arc<Self>) -> ParkGuard {
        self.lock().suspended += 1;
        ParkGuard {
            scheduler: Arc::clone(self),
        }
    }

    /// Ask for a slot back; granted ahead of any queued job.
    fn reacquire(&self) -> oneshot::Receiver<SlotGuard> {
        let (tx, rx) = oneshot::channel();
        self.lock().resumers.push_back(tx);
        self.poll();
        rx
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
    }
}

/// One occupied concurrency slot. Dropping it frees the slot and re-polls.
pub(crate) struct SlotGuard {
    scheduler: Arc<Scheduler>,
}

impl SlotGuard {
    fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.scheduler.release();
    }
}

/// Counts a job as suspended for as long as it lives.
struct ParkGuard {
    scheduler: Arc<Scheduler>,
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        let mut state = self.scheduler.lock();
        state.suspended = state.suspended.saturating_sub(1);
    }
}

#[derive(Default)]
struct LeaseState {
    slot: Option<SlotGuard>,
    parked: Option<ParkGuard>,
    /// Spawns currently awaiting a child result.
    waiting: usize,
    /// A slot request is in flight.
    resuming: bool,
    closed: bool,
}

/// The slot held by one job attempt.
///
/// While the attempt awaits spawned children the slot is handed back to the
/// scheduler, so recursive fan-out stays under the concurrency cap without
/// deadlocking on it. [`SlotLease::hold`] makes sure the attempt has its
/// slot back before it runs again, even when a spawn was abandoned mid-wait.
pub(crate) struct SlotLease {
    scheduler: Arc<Scheduler>,
    state: Mutex<LeaseState>,
}

impl SlotLease {
    fn new(scheduler: Arc<Scheduler>, slot: SlotGuard) -> Self {
        Self {
            scheduler,
            state: Mutex::new(LeaseState {
                slot: Some(slot),
                ..LeaseState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The attempt this lease belongs to has finished.
    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Give the slot back while a spawned child is awaited.
    pub(crate) fn yield_slot(self: &Arc<Self>) -> YieldedSlot {
        let released = {
            let mut state = self.lock();
            state.waiting += 1;
            let slot = state.slot.take();
            if slot.is_some() {
                state.parked = Some(self.scheduler.park());
            }
            slot
        };
        drop(released);

        YieldedSlot {
            lease: Arc::clone(self),
            pending: true,
        }
    }

    fn end_wait(&self) {
        let mut state = self.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }

    /// No slot held, none requested, and nothing left to wait for.
    fn needs_slot(&self) -> bool {
        let state = self.lock();
        !state.closed && state.waiting == 0 && !state.resuming && state.slot.is_none()
    }

    async fn reacquire(&self) {
        {
            let mut state = self.lock();
            if state.closed || state.waiting > 0 || state.resuming || state.slot.is_some() {
                return;
            }
            state.resuming = true;
        }
        let _resuming = Resuming(self);

        let Ok(slot) = self.scheduler.reacquire().await else {
            return;
        };

        let (surplus, unparked) = {
            let mut state = self.lock();
            if state.closed || state.waiting > 0 || state.slot.is_some() {
                (Some(slot), None)
            } else {
                state.slot = Some(slot);
                (None, state.parked.take())
            }
        };
        drop(unparked);
        drop(surplus);
    }

    /// Drive `fut` as this attempt, restoring the slot before every poll
    /// that would otherwise run without one.
    ///
    /// A dropped spawn future (lost `select!`, elapsed timeout) cannot
    /// reclaim the slot itself, so the attempt is held here until the
    /// scheduler grants it again.
    pub(crate) async fn hold<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        let mut fut = pin!(fut);
        let mut resume: Option<BoxFuture<'static, ()>> = None;
        poll_fn(|cx| {
            if resume.is_none() && self.needs_slot() {
                let lease = Arc::clone(&self);
                resume = Some(async move { lease.reacquire().await }.boxed());
            }
            if let Some(pending) = resume.as_mut() {
                ready!(pending.poll_unpin(cx));
                resume = None;
            }
            fut.as_mut().poll(cx)
        })
        .await
    }

    /// Close the lease at the end of an attempt, returning the slot if held.
    pub(crate) fn close(&self) -> Option<SlotGuard> {
        let (slot, parked) = {
            let mut state = self.lock();
            state.closed = true;
            (state.slot.take(), state.parked.take())
        };
        drop(parked);
        slot
    }
}

/// Clears the in-flight flag however the request ends.
struct Resuming<'a>(&'a SlotLease);

impl Drop for Resuming<'_> {
    fn drop(&mut self) {
        self.0.lock().resuming = false;
    }
}

/// A slot handed back for the duration of one spawn.
pub(crate) struct YieldedSlot {
    lease: Arc<SlotLease>,
    pending: bool,
}

impl YieldedSlot {
    /// The child settled; take a slot again once no other spawn is pending.
    pub(crate) async fn reclaim(mut self) {
        self.pending = false;
        self.lease.end_wait();
        self.lease.reacquire().await;
    }
}

impl Drop for YieldedSlot {
    fn drop(&mut self) {
        if self.pending {
            self.lease.end_wait();
        }
    }
}

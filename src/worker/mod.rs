//! Worker system — job execution and scheduling.
//!
//! Core components:
//! - `state` — Job state machine (Idle → Running → Idle/Settled)
//! - `job` — Retry, timeout and backoff around one resolver invocation
//! - `context` — Per-attempt signal and recursive spawn
//! - `scheduler` — Concurrency slots, throttle and the wake timer

pub mod context;
pub(crate) mod job;
pub(crate) mod scheduler;
pub mod state;

pub use context::JobContext;
pub use scheduler::PoolStats;
pub use state::JobState;

//! Job Pool — concurrency-limited async job scheduling with retries,
//! timeouts, dedup and recursive spawning.

pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod pool;
pub mod resolver;
pub mod worker;

pub use cache::{Digest, HashCache, ResolverCache};
pub use config::PoolConfig;
pub use error::{ConfigError, Error, FailureKind, JobError, Result};
pub use handle::JobHandle;
pub use pool::{JobPool, JobPoolBuilder};
pub use resolver::Resolver;
pub use worker::{JobContext, JobState, PoolStats};

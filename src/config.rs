//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const ENV_CONCURRENCY: &str = "JOB_POOL_CONCURRENCY";
const ENV_INTERVAL_MS: &str = "JOB_POOL_INTERVAL_MS";
const ENV_RETRY: &str = "JOB_POOL_RETRY";
const ENV_TIMEOUT_MS: &str = "JOB_POOL_TIMEOUT_MS";
const ENV_DELAY_MS: &str = "JOB_POOL_DELAY_MS";

/// Upper bound for `interval`, `timeout` and `delay`. Deadlines are computed
/// as `now + wait` and must stay representable.
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Job pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of simultaneously running jobs (`None` = unbounded).
    pub concurrency: Option<usize>,
    /// Minimum spacing between successive job starts.
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Additional attempts after the first failure.
    pub retry: u32,
    /// Per-attempt bound before the attempt fails with a timeout.
    #[serde(with = "millis_opt")]
    pub timeout: Option<Duration>,
    /// Backoff before a retried attempt becomes eligible again.
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            interval: Duration::ZERO,
            retry: 0,
            timeout: None,
            delay: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject settings that would stall the pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let waits = [
            ("interval", Some(self.interval)),
            ("timeout", self.timeout),
            ("delay", Some(self.delay)),
        ];
        for (key, wait) in waits {
            if wait.is_some_and(|wait| wait > MAX_WAIT) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("must not exceed {}ms", MAX_WAIT.as_millis()),
                });
            }
        }
        Ok(())
    }

    /// Load overrides from `JOB_POOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(concurrency) = parse_key::<usize, _>(&lookup, ENV_CONCURRENCY)? {
            config.concurrency = Some(concurrency);
        }
        if let Some(ms) = parse_key::<u64, _>(&lookup, ENV_INTERVAL_MS)? {
            config.interval = Duration::from_millis(ms);
        }
        if let Some(retry) = parse_key::<u32, _>(&lookup, ENV_RETRY)? {
            config.retry = retry;
        }
        if let Some(ms) = parse_key::<u64, _>(&lookup, ENV_TIMEOUT_MS)? {
            config.timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_key::<u64, _>(&lookup, ENV_DELAY_MS)? {
            config.delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_key<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

//! Result cache — shares one job between structurally-equal inputs.
//!
//! Entries are never evicted. Applications that need bounded memory supply
//! their own [`ResolverCache`] or call [`HashCache::clear`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::handle::JobHandle;

/// Pluggable input → result-handle store consulted on every submission.
pub trait ResolverCache<I, O>: Send + Sync {
    fn get(&self, input: &I) -> Option<JobHandle<O>>;

    fn set(&self, input: &I, handle: JobHandle<O>);
}

/// Stable content digest of an input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    /// SHA-256 over the canonical JSON form of `value`.
    ///
    /// Values go through `serde_json::Value` first, whose objects keep keys
    /// sorted, so maps with equal contents digest equally regardless of
    /// insertion order.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_value(value)?;
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Self(sha256_hex(&bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest as _;

    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// In-memory cache keyed by [`Digest`].
pub struct HashCache<O> {
    entries: RwLock<HashMap<Digest, JobHandle<O>>>,
}

impl<O> HashCache<O> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(digest)
    }

    /// Forget every entry. Jobs already running keep running.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<O> Default for HashCache<O> {
    fn default() -> Self {
        Self::new()
    }
}

fn digest_or_warn<I: Serialize>(input: &I) -> Option<Digest> {
    match Digest::of(input) {
        Ok(digest) => Some(digest),
        Err(e) => {
            warn!(error = %e, "Input is not digestible, bypassing cache");
            None
        }
    }
}

impl<I, O> ResolverCache<I, O> for HashCache<O>
where
    I: Serialize,
    O: Clone + Send + Sync + 'static,
{
    fn get(&self, input: &I) -> Option<JobHandle<O>> {
        let digest = digest_or_warn(input)?;
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&digest)
            .cloned()
    }

    fn set(&self, input: &I, handle: JobHandle<O>) {
        let Some(digest) = digest_or_warn(input) else {
            return;
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest, handle);
    }
}

//! Image-to-digest cache with a time-to-live.
//!
//! Only the pull actor inserts; [`Registry::path`](super::Registry::path)
//! reads concurrently through the read lock. Expired entries are treated as
//! absent and dropped on the next insert.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    digest: String,
    expires: Instant,
}

/// Shared handle to the digest cache.
#[derive(Debug, Clone)]
pub struct DigestCache {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl DigestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the digest of `image` if it was cached less than a TTL ago.
    pub fn get(&self, image: &str) -> Option<String> {
        let entries = self.entries.read().ok()?;
        entries
            .get(image)
            .filter(|e| e.expires > Instant::now())
            .map(|e| e.digest.clone())
    }

    /// Caches `digest` for `image` with a fresh TTL.
    pub(crate) fn insert(&self, image: &str, digest: &str) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        let now = Instant::now();
        entries.retain(|_, e| e.expires > now);
        entries.insert(
            image.to_string(),
            Entry {
                digest: digest.to_string(),
                expires: now + self.ttl,
            },
        );
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|e| e.values().filter(|e| e.expires > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

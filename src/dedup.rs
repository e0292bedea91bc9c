//! Windowed dedup cache: suppresses re-emission to the downstream
//! broadcast/remediation path for fingerprints seen within `window`,
//! without affecting store-side occurrence counting (the poller always
//! calls `IncidentStore::save_incident`; only the decision to fan out
//! further downstream is gated here).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Default suppression window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30 * 60);

struct Inner {
    seen: HashMap<String, DateTime<Utc>>,
}

/// `fingerprint -> firstSeenAt` map guarded by a single reader-writer lock.
pub struct DedupCache {
    inner: RwLock<Inner>,
    window: Duration,
}

impl DedupCache {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                seen: HashMap::new(),
            }),
            window,
        }
    }

    /// Returns `true` if `fp` is absent from the cache (read-locked).
    pub async fn is_new(&self, fp: &str) -> bool {
        !self.inner.read().await.seen.contains_key(fp)
    }

    /// Insert `fp` if absent; leaves an existing timestamp unchanged
    /// (write-locked).
    pub async fn mark_seen(&self, fp: &str, at: DateTime<Utc>) {
        let mut guard = self.inner.write().await;
        guard.seen.entry(fp.to_string()).or_insert(at);
    }

    /// Remove entries older than `window` relative to `now` (write-locked).
    /// Intended to be driven by a fixed-cadence tick independent of the
    /// poll interval (every 5 minutes by default).
    pub async fn cleanup(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(self.window).unwrap_or_default();
        let mut guard = self.inner.write().await;
        guard.seen.retain(|_, first_seen| *first_seen >= cutoff);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.read().await.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_fingerprint_reports_new_then_not() {
        let cache = DedupCache::new(DEFAULT_WINDOW);
        let now = Utc::now();
        assert!(cache.is_new("fp1").await);
        cache.mark_seen("fp1", now).await;
        assert!(!cache.is_new("fp1").await);
    }

    #[tokio::test]
    async fn mark_seen_does_not_overwrite_existing_timestamp() {
        let cache = DedupCache::new(DEFAULT_WINDOW);
        let first = Utc::now() - chrono::Duration::minutes(10);
        let later = Utc::now();
        cache.mark_seen("fp1", first).await;
        cache.mark_seen("fp1", later).await;

        let cutoff = later - chrono::Duration::minutes(5);
        cache.cleanup(cutoff).await;
        // first < cutoff means entry should have been evicted, proving the
        // timestamp was never bumped to `later`.
        assert!(cache.is_new("fp1").await);
    }

    #[tokio::test]
    async fn cleanup_evicts_entries_older_than_window() {
        let cache = DedupCache::new(Duration::from_secs(60));
        let old = Utc::now() - chrono::Duration::minutes(5);
        let fresh = Utc::now();
        cache.mark_seen("old", old).await;
        cache.mark_seen("fresh", fresh).await;

        cache.cleanup(Utc::now()).await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.is_new("old").await);
        assert!(!cache.is_new("fresh").await);
    }
}

//! Deduplication cache for classifier results.
//!
//! Collapses bursts of identical text into a single classifier call. Purely a
//! cost/latency optimization: the cached value is an assessment, never a
//! decision, so warning state is still updated once per message.

use crate::assessment::ViolationAssessment;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Case-insensitive, trimmed, content-derived cache key: the hex SHA-256 of
/// the normalized text, so keys stay fixed-size and never carry user content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let normalized = text.trim().to_lowercase();
        Self(hex::encode(Sha256::digest(normalized.as_bytes())))
    }

    /// Fingerprint scoped to a request context (e.g. language hints), so the
    /// same text classified under different hints does not collide.
    pub fn scoped(text: &str, scope: &str) -> Self {
        let base = Self::of(text);
        if scope.is_empty() {
            base
        } else {
            Self(format!("{}:{}", scope, base.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: ViolationAssessment,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Slot = Arc<OnceCell<CacheEntry>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheCounters {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct DeduplicationCache {
    entries: Mutex<HashMap<Fingerprint, Slot>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DeduplicationCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached assessment for `key`, or run `compute` once and
    /// cache its result. Concurrent callers with the same key share one
    /// in-flight computation. Errors are returned to the caller that ran
    /// `compute` and are never cached; a waiting caller then computes itself.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &Fingerprint,
        compute: F,
    ) -> Result<ViolationAssessment, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ViolationAssessment, E>>,
    {
        let slot = self.slot(key).await;
        let mut computed = false;

        let result = slot
            .get_or_try_init(|| {
                computed = true;
                let ttl = self.ttl;
                async move {
                    let value = compute().await?;
                    Ok::<_, E>(CacheEntry {
                        value,
                        expires_at: Instant::now() + ttl,
                    })
                }
            })
            .await;

        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                self.discard_failed(key, &slot).await;
                return Err(e);
            }
        };

        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dedup cache hit for {}", truncate_key(key));
        }
        Ok(entry.value.clone())
    }

    /// Cached assessment without computing anything.
    pub async fn get(&self, key: &Fingerprint) -> Option<ViolationAssessment> {
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?.get()?;
        (!entry.is_expired(Instant::now())).then(|| entry.value.clone())
    }

    /// Drop every expired entry, plus failed slots nobody is waiting on;
    /// returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, slot| match slot.get() {
            Some(entry) => !entry.is_expired(now),
            None => Arc::strong_count(slot) > 1,
        });
        before - entries.len()
    }

    pub async fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
        }
    }

    /// Background task sweeping expired entries every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                let removed = cache.sweep_expired().await;
                if removed > 0 {
                    log::debug!("Dedup cache sweep removed {removed} expired entries");
                }
            }
        })
    }

    /// Remove the slot a failed computation left behind, unless another caller
    /// already replaced or filled it.
    async fn discard_failed(&self, key: &Fingerprint, slot: &Slot) {
        let mut entries = self.entries.lock().await;
        if let Some(current) = entries.get(key) {
            if Arc::ptr_eq(current, slot) && current.get().is_none() {
                entries.remove(key);
            }
        }
    }

    /// Live or in-flight slot for `key`; expired slots are replaced lazily.
    async fn slot(&self, key: &Fingerprint) -> Slot {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(slot) if slot.get().map_or(true, |entry| !entry.is_expired(now)) => slot.clone(),
            _ => {
                let slot = Arc::new(OnceCell::new());
                entries.insert(key.clone(), slot.clone());
                slot
            }
        }
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

fn truncate_key(key: &Fingerprint) -> &str {
    let s = key.as_str();
    match s.char_indices().nth(16) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::{raw_scores, ScoreNormalizer};
    use std::sync::atomic::AtomicUsize;

    fn sample(score: f64) -> ViolationAssessment {
        ScoreNormalizer::default()
            .normalize(Some(&raw_scores(&[("toxicity", score)])), None)
            .unwrap()
    }

    #[test]
    fn test_fingerprint_normalization() {
        assert_eq!(Fingerprint::of("  Buy NOW  "), Fingerprint::of("buy now"));
        assert_eq!(Fingerprint::of("buy now").as_str().len(), 64);
        assert_eq!(Fingerprint::of(&"spam ".repeat(600)).as_str().len(), 64);
        assert!(!Fingerprint::of("buy now").as_str().contains("buy"));
        assert_ne!(Fingerprint::of("buy now"), Fingerprint::of("buy later"));
        assert_ne!(
            Fingerprint::scoped("hello", "pt,en"),
            Fingerprint::scoped("hello", "en")
        );
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let cache = DeduplicationCache::default();
        let calls = AtomicUsize::new(0);
        let key = Fingerprint::of("same spam");

        for _ in 0..3 {
            let value = cache
                .get_or_compute(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(sample(0.9))
                })
                .await
                .unwrap();
            assert_eq!(value.max_score, 0.9);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let counters = cache.counters().await;
        assert_eq!(counters.hits, 2);
        assert_eq!(counters.misses, 1);
        assert_eq!(counters.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = DeduplicationCache::new(Duration::from_secs(300));
        let key = Fingerprint::of("hello");
        cache
            .get_or_compute(&key, || async { Ok::<_, ()>(sample(0.1)) })
            .await
            .unwrap();
        assert!(cache.get(&key).await.is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.get(&key).await.is_none());

        let value = cache
            .get_or_compute(&key, || async { Ok::<_, ()>(sample(0.2)) })
            .await
            .unwrap();
        assert_eq!(value.max_score, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let cache = DeduplicationCache::new(Duration::from_secs(60));
        for text in ["a", "b", "c"] {
            cache
                .get_or_compute(&Fingerprint::of(text), || async { Ok::<_, ()>(sample(0.1)) })
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        cache
            .get_or_compute(&Fingerprint::of("d"), || async { Ok::<_, ()>(sample(0.1)) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.sweep_expired().await, 3);
        assert_eq!(cache.counters().await.entries, 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = DeduplicationCache::default();
        let key = Fingerprint::of("flaky");

        let failed = cache
            .get_or_compute(&key, || async { Err::<ViolationAssessment, _>("down") })
            .await;
        assert_eq!(failed, Err("down"));

        let value = cache
            .get_or_compute(&key, || async { Ok::<_, &str>(sample(0.4)) })
            .await
            .unwrap();
        assert_eq!(value.max_score, 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_computations_leave_no_entries() {
        let cache = DeduplicationCache::new(Duration::from_secs(60));
        for i in 0..100 {
            let failed = cache
                .get_or_compute(&Fingerprint::of(&format!("outage message {i}")), || async {
                    Err::<ViolationAssessment, _>("classifier down")
                })
                .await;
            assert!(failed.is_err());
        }
        assert_eq!(cache.counters().await.entries, 0);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.sweep_expired().await, 0);
        assert_eq!(cache.counters().await.entries, 0);
    }

    #[tokio::test]
    async fn test_sweep_drops_abandoned_empty_slots() {
        let cache = DeduplicationCache::default();
        let key = Fingerprint::of("abandoned");
        drop(cache.slot(&key).await);
        assert_eq!(cache.counters().await.entries, 1);

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.counters().await.entries, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_burst_computes_once() {
        let cache = Arc::new(DeduplicationCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    let text = if i % 2 == 0 { "FREE MONEY" } else { " free money " };
                    cache
                        .get_or_compute(&Fingerprint::of(text), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ()>(sample(0.8))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().max_score, 0.8);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! C5 — Cache: a namespace:hash-keyed, TTL+LRU in-memory store with a
//! change-stream for `resources/list_changed` notifications.
//!
//! No persistent-storage cache existed to adapt here (out of scope by
//! design); the single-flight/TTL bookkeeping is grounded on a `jwks-cache`
//! `CacheManager` (freshness check, staleness, `expires_at`), narrowed here
//! to a plain `HashMap` since this cache holds many keys rather than one.
use fetchguard_core::CacheEntry;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub namespace: String,
    pub url_hash: String,
    pub list_changed: bool,
}

struct Slot {
    entry: CacheEntry,
    expires_at_ms: u64,
    last_accessed_ms: u64,
}

pub struct Cache {
    inner: Mutex<HashMap<String, Slot>>,
    enabled: bool,
    default_ttl: Duration,
    max_entries: usize,
    changes_tx: watch::Sender<Option<ChangeEvent>>,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub(crate) fn now_rfc3339() -> String {
    humantime_like_rfc3339(now_ms())
}

/// Minimal RFC3339 rendering (UTC, millisecond precision) without pulling in
/// `chrono`/`time` purely for a timestamp string.
pub(crate) fn humantime_like_rfc3339(epoch_ms: u64) -> String {
    let secs = epoch_ms / 1000;
    let millis = epoch_ms % 1000;
    let days = secs / 86_400;
    let time_of_day = secs % 86_400;
    let (h, m, s) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    // Civil-from-days (Howard Hinnant's algorithm), good for the whole
    // range we'll ever format.
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let mth = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if mth <= 2 { y + 1 } else { y };

    format!("{y:04}-{mth:02}-{d:02}T{h:02}:{m:02}:{s:02}.{millis:03}Z")
}

impl Cache {
    pub fn new(enabled: bool, default_ttl: Duration, max_entries: usize) -> Self {
        let (changes_tx, _rx) = watch::channel(None);
        Self {
            inner: Mutex::new(HashMap::new()),
            enabled,
            default_ttl,
            max_entries,
            changes_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ChangeEvent>> {
        self.changes_tx.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Normal reads respect TTL and the global `enabled` flag. Forced reads
    /// bypass both, so the resource-link path can serve an entry that was
    /// written while the cache was disabled, or has since expired.
    pub fn get(&self, key: &str, force: bool) -> Option<CacheEntry> {
        if !self.enabled && !force {
            return None;
        }
        let mut guard = self.lock();
        let now = now_ms();
        let slot = guard.get_mut(key)?;
        if !force && slot.expires_at_ms <= now {
            return None;
        }
        slot.last_accessed_ms = now;
        Some(slot.entry.clone())
    }

    /// Stores `content` under `key` with `fetchedAt=now`, `expiresAt=now+ttl`.
    /// Emits an update event on the change stream; `listChanged` is true iff
    /// the key set actually grew.
    pub fn set(&self, key: &str, content: String, url: String, title: Option<String>, ttl: Option<Duration>) {
        let namespace = key.split(':').next().unwrap_or_default().to_string();
        let now = now_ms();
        let ttl_ms = ttl.unwrap_or(self.default_ttl).as_millis() as u64;
        let entry = CacheEntry {
            content,
            fetched_at: now_rfc3339(),
            expires_at: humantime_like_rfc3339(now + ttl_ms),
            url,
            title,
        };

        let list_changed = {
            let mut guard = self.lock();
            let is_new = !guard.contains_key(key);
            guard.insert(
                key.to_string(),
                Slot { entry, expires_at_ms: now + ttl_ms, last_accessed_ms: now },
            );
            self.evict_lru_locked(&mut guard);
            is_new
        };

        let _ = self.changes_tx.send(Some(ChangeEvent {
            namespace,
            url_hash: key.to_string(),
            list_changed,
        }));
    }

    /// Sweeps TTL-expired entries; called on read, on an explicit call, and
    /// from the background cleanup loop.
    pub fn evict_expired(&self) -> usize {
        let now = now_ms();
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, slot| slot.expires_at_ms > now);
        before - guard.len()
    }

    fn evict_lru_locked(&self, guard: &mut HashMap<String, Slot>) {
        while guard.len() > self.max_entries {
            if let Some(oldest_key) = guard
                .iter()
                .min_by_key(|(_, slot)| slot.last_accessed_ms)
                .map(|(k, _)| k.clone())
            {
                guard.remove(&oldest_key);
            } else {
                break;
            }
        }
    }

    /// All live (not expired) keys, for resource enumeration. The same
    /// `namespace:hash` shape the pipeline writes under.
    pub fn list_keys(&self) -> Vec<String> {
        let now = now_ms();
        self.lock().iter().filter(|(_, slot)| slot.expires_at_ms > now).map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs forever, sweeping expired entries on a fixed interval. Intended
    /// to be spawned once per server lifetime.
    pub async fn run_cleanup_loop(cache: std::sync::Arc<Cache>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = cache.evict_expired();
            if reaped > 0 {
                tracing::debug!(reaped, "cache cleanup reaped expired entries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let cache = Cache::new(true, Duration::from_secs(60), 100);
        cache.set("markdown:abc", "hello".to_string(), "https://x".to_string(), None, None);
        let entry = cache.get("markdown:abc", false).unwrap();
        assert_eq!(entry.content, "hello");
    }

    #[test]
    fn disabled_cache_returns_none_for_normal_reads() {
        let cache = Cache::new(false, Duration::from_secs(60), 100);
        cache.set("markdown:abc", "hello".to_string(), "https://x".to_string(), None, None);
        assert!(cache.get("markdown:abc", false).is_none());
        assert!(cache.get("markdown:abc", true).is_some());
    }

    #[test]
    fn expired_entry_is_invisible_to_normal_reads_but_visible_to_forced() {
        let cache = Cache::new(true, Duration::from_millis(0), 100);
        cache.set("markdown:abc", "hello".to_string(), "https://x".to_string(), None, None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("markdown:abc", false).is_none());
        assert!(cache.get("markdown:abc", true).is_some());
    }

    #[test]
    fn lru_eviction_respects_max_entries() {
        let cache = Cache::new(true, Duration::from_secs(60), 2);
        cache.set("markdown:a", "1".to_string(), "https://a".to_string(), None, None);
        cache.set("markdown:b", "2".to_string(), "https://b".to_string(), None, None);
        cache.set("markdown:c", "3".to_string(), "https://c".to_string(), None, None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("markdown:a", false).is_none());
    }

    #[tokio::test]
    async fn set_emits_list_changed_only_on_new_key() {
        let cache = Cache::new(true, Duration::from_secs(60), 100);
        let mut rx = cache.subscribe();
        cache.set("markdown:a", "1".to_string(), "https://a".to_string(), None, None);
        rx.changed().await.unwrap();
        assert!(rx.borrow().as_ref().unwrap().list_changed);
        cache.set("markdown:a", "2".to_string(), "https://a".to_string(), None, None);
        rx.changed().await.unwrap();
        assert!(!rx.borrow().as_ref().unwrap().list_changed);
    }
}

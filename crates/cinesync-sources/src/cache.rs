use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry<V> {
    stored_at: Instant,
    value: V,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    last_sweep: Instant,
}

/// Thread-safe key/value cache with a fixed time-to-live.
///
/// Expired entries read as misses. Removal of expired entries happens in a
/// sweep that piggybacks on normal `get`/`put` traffic once `sweep_interval`
/// has passed since the previous sweep; there is no background task.
pub struct ResponseCache<V> {
    ttl: Duration,
    sweep_interval: Duration,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            ttl,
            sweep_interval,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        self.put_at(key, value, Instant::now());
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.maybe_sweep(&mut inner, now);

        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.stored_at) > self.ttl,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn put_at(&self, key: impl Into<String>, value: V, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.maybe_sweep(&mut inner, now);
        inner.entries.insert(key.into(), Entry { stored_at: now, value });
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }

    fn maybe_sweep(&self, inner: &mut Inner<V>, now: Instant) {
        if now.saturating_duration_since(inner.last_sweep) < self.sweep_interval {
            return;
        }
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) <= ttl);
        inner.last_sweep = now;

        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, remaining = inner.entries.len(), "Swept expired cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(3600);
    const SWEEP: Duration = Duration::from_secs(300);
    const EPSILON: Duration = Duration::from_millis(10);

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = ResponseCache::new(TTL, SWEEP);
        let t = Instant::now();
        cache.put_at("movie/27205", 1u32, t);

        assert_eq!(cache.get_at("movie/27205", t + TTL - EPSILON), Some(1));
        assert_eq!(cache.get_at("movie/27205", t + TTL + EPSILON), None);
    }

    #[test]
    fn test_sweep_removes_expired_entries_on_access() {
        let cache = ResponseCache::new(Duration::from_secs(60), Duration::from_secs(30));
        let t = Instant::now();
        cache.put_at("old", "a".to_string(), t);
        cache.put_at("fresh", "b".to_string(), t + Duration::from_secs(50));
        assert_eq!(cache.len(), 2);

        // Reading an unrelated key past the sweep interval drops the expired entry
        assert_eq!(cache.get_at("missing", t + Duration::from_secs(90)), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at("fresh", t + Duration::from_secs(90)), Some("b".to_string()));
    }

    #[test]
    fn test_no_sweep_before_interval() {
        let cache = ResponseCache::new(Duration::from_secs(1), Duration::from_secs(300));
        let t = Instant::now();
        cache.put_at("a", 1, t);
        cache.put_at("b", 2, t + Duration::from_secs(5));
        // "a" is expired but not yet swept
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(ResponseCache::new(TTL, SWEEP));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("{}:{}", worker, i);
                        cache.put(key.clone(), i);
                        assert_eq!(cache.get(&key), Some(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 200);
    }
}

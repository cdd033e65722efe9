use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

/// Small TTL cache for hot lookups (amenities on the booking path).
/// Owned by whoever constructs it; nothing here is process-global.
pub struct TtlCache<V> {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<String, CacheEntry<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let ttl = self.ttl;
        self.entries.retain(|_, v| v.created_at.elapsed() <= ttl);
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&mut self, key: String, value: V) {
        let ttl = self.ttl;
        self.entries.retain(|_, v| v.created_at.elapsed() <= ttl);
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            if let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.created_at)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c".into(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let mut cache = TtlCache::new(Duration::ZERO, 8);
        cache.insert("a".into(), 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn invalidate_drops_entry() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 8);
        cache.insert("a".into(), 1);
        cache.invalidate("a");
        assert!(cache.is_empty());
    }
}

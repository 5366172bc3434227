use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Bounded in-memory cache with a time-to-live per entry.
///
/// Reads never reorder entries, so a hit only costs one short lock. When the
/// cache is full, expired entries are pruned and then the oldest insertion is
/// evicted. A capacity of zero disables caching.
///
/// Removals leave their slot in the insertion queue; stale slots are skipped
/// on eviction and compacted once they outnumber live entries.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    inner: Mutex<CacheState<K, V>>,
    capacity: usize,
    default_ttl: Duration,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Insertion queue of `(key, seq)`; a slot is live while its seq matches.
    order: VecDeque<(K, u64)>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    seq: u64,
}

const MIN_COMPACT_LEN: usize = 64;

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries for `default_ttl` each.
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
            capacity,
            default_ttl,
        }
    }

    /// Returns the default time-to-live.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns a live entry, dropping it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        if self.capacity == 0 {
            return None;
        }

        let now = Instant::now();
        let mut guard = self.inner.lock();
        let expired = match guard.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            Self::remove_key(&mut guard, key);
        }
        None
    }

    /// Inserts with the default time-to-live.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Inserts with an explicit time-to-live. A zero TTL removes the key.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.insert_when(key, value, ttl, || true);
    }

    /// Inserts only if `condition` holds, evaluated under the cache lock.
    ///
    /// Returns whether the value was stored.
    pub fn insert_when(
        &self,
        key: K,
        value: V,
        ttl: Duration,
        condition: impl FnOnce() -> bool,
    ) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let now = Instant::now();
        let mut guard = self.inner.lock();
        if !condition() {
            return false;
        }
        Self::remove_key(&mut guard, &key);
        if ttl.is_zero() {
            return false;
        }

        if guard.entries.len() >= self.capacity {
            Self::prune_expired(&mut guard, now);
            Self::evict_oldest(&mut guard, self.capacity - 1);
        }
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                seq,
            },
        );
        guard.order.push_back((key, seq));
        true
    }

    /// Removes an entry, returning its value if it was present and live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        Self::remove_key(&mut guard, key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value)
    }

    /// Runs `f` under the cache lock, then removes `key`.
    ///
    /// Lets callers bump a generation counter atomically with the removal.
    pub fn remove_with(&self, key: &K, f: impl FnOnce()) {
        let mut guard = self.inner.lock();
        f();
        Self::remove_key(&mut guard, key);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.entries.clear();
        guard.order.clear();
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Returns the number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_key(state: &mut CacheState<K, V>, key: &K) -> Option<CacheEntry<V>> {
        let removed = state.entries.remove(key);
        if removed.is_some() && state.order.len() > MIN_COMPACT_LEN.max(2 * state.entries.len()) {
            Self::compact(state);
        }
        removed
    }

    fn prune_expired(state: &mut CacheState<K, V>, now: Instant) {
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.expires_at > now);
        if state.entries.len() != before {
            Self::compact(state);
        }
    }

    fn compact(state: &mut CacheState<K, V>) {
        let entries = &state.entries;
        state
            .order
            .retain(|(key, seq)| entries.get(key).is_some_and(|entry| entry.seq == *seq));
    }

    fn evict_oldest(state: &mut CacheState<K, V>, keep: usize) {
        while state.entries.len() > keep {
            let Some((key, seq)) = state.order.pop_front() else {
                break;
            };
            if state.entries.get(&key).is_some_and(|entry| entry.seq == seq) {
                state.entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cache_should_evict_oldest_insertion() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        let _ = cache.get(&"a");
        cache.insert("c", 3);

        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn ttl_should_expire_entries() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert_with_ttl("a", 1, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));

        assert!(cache.get(&"a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_should_replace_value_and_ttl() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert_with_ttl("a", 1, Duration::from_millis(10));
        cache.insert("a", 2);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insert_when_should_skip_on_false_condition() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        assert!(!cache.insert_when("a", 1, Duration::from_secs(1), || false));
        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn zero_capacity_should_disable_caching() {
        let cache = TtlCache::new(0, Duration::from_secs(60));
        cache.insert("a", 1);
        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn remove_should_return_live_value() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.remove(&"a"), None);
    }

    #[test]
    fn reinsert_should_not_be_evicted_by_its_stale_slot() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 3);
        cache.insert("c", 4);

        assert!(cache.get(&"b").is_none());
        assert_eq!(cache.get(&"a"), Some(3));
        assert_eq!(cache.get(&"c"), Some(4));
    }

    #[test]
    fn full_cache_should_prefer_expired_entries() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert_with_ttl("b", 2, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn churn_should_keep_insertion_queue_bounded() {
        let cache = TtlCache::new(1_000, Duration::from_secs(60));
        for round in 0..10_000u32 {
            cache.insert(round % 4, round);
            cache.remove(&(round % 4));
        }
        assert!(cache.is_empty());
        assert!(cache.queued() <= MIN_COMPACT_LEN + 1);
    }
}

//! Size- and age-bounded least-recently-used cache.
use std::{
    collections::HashMap,
    hash::Hash,
    sync::RwLock,
    time::{Duration, Instant},
};

/// Thread-safe LRU cache with a time-to-live.
///
/// Entries live in a slab and are threaded into a doubly linked list ordered from least to most
/// recently used, so promotion and eviction are O(1). All mutating operations take the write
/// lock; [`LruCache::peek`] only needs the read lock.
pub struct LruCache<K, V> {
    max_size: usize,
    timeout: Duration,
    inner: RwLock<Inner<K, V>>,
}

struct Entry<K, V> {
    key: K,
    value: V,
    saved_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    /// Least recently used.
    head: Option<usize>,
    /// Most recently used.
    tail: Option<usize>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub const MIN_SIZE: usize = 1;
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(10);

    /// Create a cache holding at most `max_size` entries, each valid for `timeout` after it was
    /// saved. Values below [`Self::MIN_SIZE`] and [`Self::MIN_TIMEOUT`] are raised to the minimum.
    pub fn new(max_size: usize, timeout: Duration) -> LruCache<K, V> {
        LruCache {
            max_size: max_size.max(Self::MIN_SIZE),
            timeout: timeout.max(Self::MIN_TIMEOUT),
            inner: RwLock::new(Inner::new()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Return the value and mark it as most recently used.
    ///
    /// An expired entry is removed and reported as a miss. If the most recently used entry has
    /// expired as well, every other entry is older, so the whole cache is cleared.
    pub fn lookup(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.write().ok()?;
        let idx = *inner.index.get(key)?;
        let now = Instant::now();

        if inner.is_expired(idx, self.timeout, now) {
            inner.remove(idx);
            if let Some(tail) = inner.tail {
                if inner.is_expired(tail, self.timeout, now) {
                    inner.clear();
                }
            }
            return None;
        }

        inner.unlink(idx);
        inner.push_back(idx);
        inner.entry(idx).map(|entry| entry.value.clone())
    }

    /// Return the value without changing the recency order.
    pub fn peek(&self, key: &K) -> Option<V> {
        let inner = self.inner.read().ok()?;
        let idx = *inner.index.get(key)?;
        if inner.is_expired(idx, self.timeout, Instant::now()) {
            return None;
        }
        inner.entry(idx).map(|entry| entry.value.clone())
    }

    /// Insert or replace the value, evicting least recently used entries over capacity.
    pub fn save(&self, key: K, value: V) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };

        if let Some(idx) = inner.index.get(&key).copied() {
            inner.remove(idx);
        }
        inner.insert(key, value, Instant::now());

        while inner.index.len() > self.max_size {
            let Some(head) = inner.head else {
                break;
            };
            inner.remove(head);
        }
    }

    /// Returns `true` if an entry was removed.
    pub fn remove(&self, key: &K) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        match inner.index.get(key).copied() {
            Some(idx) => {
                inner.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map_or(0, |inner| inner.index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Inner<K, V> {
        Inner {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn entry(&self, idx: usize) -> Option<&Entry<K, V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, idx: usize) -> Option<&mut Entry<K, V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn is_expired(&self, idx: usize, timeout: Duration, now: Instant) -> bool {
        self.entry(idx)
            .map_or(true, |entry| now.duration_since(entry.saved_at) >= timeout)
    }

    fn insert(&mut self, key: K, value: V, saved_at: Instant) {
        let entry = Entry {
            key: key.clone(),
            value,
            saved_at,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_back(idx);
    }

    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(entry) = self.slots.get_mut(idx).and_then(Option::take) {
            self.index.remove(&entry.key);
            self.free.push(idx);
        }
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.entry(idx).map(|entry| (entry.prev, entry.next)) else {
            return;
        };

        match prev {
            Some(prev) => {
                if let Some(entry) = self.entry_mut(prev) {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(entry) = self.entry_mut(next) {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(entry) = self.entry_mut(idx) {
            entry.prev = None;
            entry.next = None;
        }
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(entry) = self.entry_mut(idx) {
            entry.prev = old_tail;
            entry.next = None;
        }
        match old_tail {
            Some(tail) => {
                if let Some(entry) = self.entry_mut(tail) {
                    entry.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::LruCache;

    const LONG: Duration = Duration::from_secs(600);

    #[test]
    fn save_then_lookup() {
        let cache = LruCache::new(10, LONG);
        cache.save("a", 1);
        cache.save("b", 2);

        assert_eq!(cache.lookup(&"a"), Some(1));
        assert_eq!(cache.lookup(&"b"), Some(2));
        assert_eq!(cache.lookup(&"c"), None);
    }

    #[test]
    fn save_replaces_existing_value() {
        let cache = LruCache::new(10, LONG);
        cache.save("a", 1);
        cache.save("a", 2);

        assert_eq!(cache.lookup(&"a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used_by_access() {
        let cache = LruCache::new(3, LONG);
        cache.save("a", 1);
        cache.save("b", 2);
        cache.save("c", 3);

        // "a" was inserted first but is now the most recently used.
        assert_eq!(cache.lookup(&"a"), Some(1));
        cache.save("d", 4);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.peek(&"b"), None);
        assert_eq!(cache.peek(&"a"), Some(1));
        assert_eq!(cache.peek(&"c"), Some(3));
        assert_eq!(cache.peek(&"d"), Some(4));
    }

    #[test]
    fn peek_does_not_promote() {
        let cache = LruCache::new(2, LONG);
        cache.save("a", 1);
        cache.save("b", 2);

        assert_eq!(cache.peek(&"a"), Some(1));
        cache.save("c", 3);

        assert_eq!(cache.peek(&"a"), None);
        assert_eq!(cache.peek(&"b"), Some(2));
    }

    #[test]
    fn remove_and_reset() {
        let cache = LruCache::new(10, LONG);
        cache.save("a", 1);
        cache.save("b", 2);

        assert!(cache.remove(&"a"));
        assert!(!cache.remove(&"a"));
        assert_eq!(cache.lookup(&"a"), None);
        assert_eq!(cache.lookup(&"b"), Some(2));

        cache.reset();
        assert!(cache.is_empty());

        // Slots are reused after removal.
        cache.save("c", 3);
        assert_eq!(cache.lookup(&"c"), Some(3));
    }

    #[test]
    fn floors_size_and_timeout() {
        let cache = LruCache::<&str, i32>::new(0, Duration::ZERO);
        assert_eq!(cache.max_size(), LruCache::<&str, i32>::MIN_SIZE);
        assert_eq!(cache.timeout(), LruCache::<&str, i32>::MIN_TIMEOUT);

        cache.save("a", 1);
        cache.save("b", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&"b"), Some(2));
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = LruCache::new(10, Duration::from_millis(50));
        cache.save("a", 1);
        thread::sleep(Duration::from_millis(80));

        assert_eq!(cache.peek(&"a"), None);
        assert_eq!(cache.lookup(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_most_recent_entry_resets_cache() {
        let cache = LruCache::new(10, Duration::from_millis(50));
        cache.save("a", 1);
        cache.save("b", 2);
        cache.save("c", 3);
        thread::sleep(Duration::from_millis(80));

        assert_eq!(cache.lookup(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn fresh_most_recent_entry_keeps_cache() {
        let cache = LruCache::new(10, Duration::from_millis(200));
        cache.save("a", 1);
        thread::sleep(Duration::from_millis(250));
        cache.save("b", 2);

        assert_eq!(cache.lookup(&"a"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&"b"), Some(2));
    }

    #[test]
    fn concurrent_saves() {
        let cache = Arc::new(LruCache::new(1000, LONG));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        cache.save(t * 100 + i, i);
                        cache.lookup(&(t * 100 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 800);
    }
}

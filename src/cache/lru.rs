use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bounded key/value cache with least-recently-used eviction
///
/// Both reads and writes count as a use. The cache is internally locked so it
/// can be shared behind an `Arc` by any number of callers.
pub struct LruCache<K, V> {
    limit: usize,
    inner: Mutex<LruState<K, V>>,
}

struct LruState<K, V> {
    /// key -> (value, recency stamp)
    entries: HashMap<K, (V, u64)>,
    /// recency stamp -> key, oldest first
    order: BTreeMap<u64, K>,
    clock: u64,
}

impl<K, V> LruState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Moves an existing key to the most-recently-used end
    fn promote(&mut self, key: &K) {
        let stamp = self.next_stamp();
        if let Some((_, old_stamp)) = self.entries.get_mut(key) {
            let previous = std::mem::replace(old_stamp, stamp);
            self.order.remove(&previous);
            self.order.insert(stamp, key.clone());
        }
    }

    fn evict_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `limit` entries. A limit of zero caches nothing.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                clock: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LruState<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached value and marks it most-recently-used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state();
        let value = state.entries.get(key).map(|(value, _)| value.clone())?;
        state.promote(key);
        Some(value)
    }

    /// Returns the cached value without touching its recency
    pub fn peek(&self, key: &K) -> Option<V> {
        self.state().entries.get(key).map(|(value, _)| value.clone())
    }

    /// Inserts or overwrites a value, evicting the least-recently-used entry when full
    pub fn set(&self, key: K, value: V) {
        if self.limit == 0 {
            return;
        }

        let mut state = self.state();
        if state.entries.contains_key(&key) {
            state.promote(&key);
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.0 = value;
            }
            return;
        }

        while state.entries.len() >= self.limit {
            if state.evict_oldest().is_none() {
                break;
            }
        }

        let stamp = state.next_stamp();
        state.order.insert(stamp, key.clone());
        state.entries.insert(key, (value, stamp));
    }

    /// Removes a key, returning its value if it was cached
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state();
        let (value, stamp) = state.entries.remove(key)?;
        state.order.remove(&stamp);
        Some(value)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.order.clear();
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.state().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

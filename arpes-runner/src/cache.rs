//! In-memory result cache keyed by provenance fingerprint.
//!
//! Each fingerprint owns a slot with its own lock. The first caller computes
//! while later callers for the same key block on the slot and then reuse the
//! value, so each fingerprint is computed at most once. A failed computation
//! stores nothing: the next caller retries, and the slot is dropped when no
//! other caller is waiting on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use arpes_core::provenance::Fingerprint;

type Slot<V> = Arc<Mutex<Option<V>>>;

/// Cache for step products. Create one per run or per process and pass it by
/// reference; values are cloned out, so store `Arc`s for large products.
#[derive(Debug)]
pub struct FingerprintCache<V> {
    slots: Mutex<HashMap<Fingerprint, Slot<V>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<V> Default for FingerprintCache<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic mid-compute leaves the slot empty, which is a valid state.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: Clone> FingerprintCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, fingerprint: &Fingerprint) -> Slot<V> {
        lock(&self.slots)
            .entry(fingerprint.clone())
            .or_default()
            .clone()
    }

    /// Cached value for `fingerprint`, if one has been computed.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<V> {
        let slot = lock(&self.slots).get(fingerprint).cloned()?;
        let value = lock(&slot).clone();
        value
    }

    /// Store a value, replacing any previous one.
    pub fn insert(&self, fingerprint: &Fingerprint, value: V) {
        let slot = self.slot(fingerprint);
        *lock(&slot) = Some(value);
    }

    /// Cached value, or the result of `compute` stored under `fingerprint`.
    ///
    /// The flag is `true` on a cache hit. Errors are returned and not cached.
    pub fn get_or_compute<E>(
        &self,
        fingerprint: &Fingerprint,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<(V, bool), E> {
        let slot = self.slot(fingerprint);
        let mut guard = lock(&slot);
        if let Some(value) = guard.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = fingerprint.short(), "cache hit");
            return Ok((value.clone(), true));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = fingerprint.short(), "cache miss");
        let value = match compute() {
            Ok(value) => value,
            Err(e) => {
                drop(guard);
                self.forget_empty(fingerprint, &slot);
                return Err(e);
            }
        };
        *guard = Some(value.clone());
        Ok((value, false))
    }

    /// Drop the slot of a failed computation unless another caller holds it.
    fn forget_empty(&self, fingerprint: &Fingerprint, slot: &Slot<V>) {
        let mut slots = lock(&self.slots);
        let ours = slots.get(fingerprint).is_some_and(|s| Arc::ptr_eq(s, slot));
        // One reference in the map, one here: nobody is waiting on it.
        let unshared = Arc::strong_count(slot) == 2;
        let empty = slot.try_lock().map(|g| g.is_none()).unwrap_or(false);
        if ours && unshared && empty {
            slots.remove(fingerprint);
        }
    }

    /// Number of fingerprints with a stored value.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot<V>> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter(|s| lock(s).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fp(op: &str) -> Fingerprint {
        arpes_core::provenance::fingerprint(op, &Default::default(), &[])
    }

    #[test]
    fn computes_once_then_hits() {
        let cache: FingerprintCache<u32> = FingerprintCache::new();
        let key = fp("a");
        let (v, hit) = cache.get_or_compute(&key, || Ok::<_, ()>(7)).unwrap();
        assert_eq!((v, hit), (7, false));
        let (v, hit) = cache.get_or_compute(&key, || Ok::<_, ()>(8)).unwrap();
        assert_eq!((v, hit), (7, true));
        assert_eq!(cache.lookup(&key), Some(7));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn failures_are_not_cached() {
        let cache: FingerprintCache<u32> = FingerprintCache::new();
        let key = fp("b");
        assert!(cache.get_or_compute(&key, || Err("boom")).is_err());
        assert_eq!(cache.lookup(&key), None);
        assert!(cache.is_empty());
        let (v, hit) = cache.get_or_compute(&key, || Ok::<_, &str>(3)).unwrap();
        assert_eq!((v, hit), (3, false));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_fingerprints_leave_no_slots_behind() {
        let cache: FingerprintCache<u32> = FingerprintCache::new();
        for i in 0..100 {
            let key = fp(&format!("failing-{i}"));
            assert!(cache.get_or_compute(&key, || Err::<u32, _>("boom")).is_err());
        }
        assert_eq!(lock(&cache.slots).len(), 0);
        assert_eq!(cache.misses(), 100);

        cache.insert(&fp("kept"), 1);
        assert!(cache.get_or_compute(&fp("other"), || Err::<u32, _>("boom")).is_err());
        assert_eq!(lock(&cache.slots).len(), 1);
        assert_eq!(cache.lookup(&fp("kept")), Some(1));
    }

    #[test]
    fn concurrent_callers_compute_each_key_once() {
        let cache: FingerprintCache<usize> = FingerprintCache::new();
        let computed = AtomicUsize::new(0);
        let keys: Vec<Fingerprint> = (0..4).map(|i| fp(&i.to_string())).collect();

        thread::scope(|s| {
            for t in 0..8 {
                let (cache, computed, keys) = (&cache, &computed, &keys);
                s.spawn(move || {
                    for key in keys.iter().cycle().skip(t).take(keys.len()) {
                        cache
                            .get_or_compute(key, || {
                                computed.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(std::time::Duration::from_millis(2));
                                Ok::<_, ()>(key.as_str().len())
                            })
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(computed.load(Ordering::SeqCst), keys.len());
        assert_eq!(cache.len(), keys.len());
        assert_eq!(cache.hits() + cache.misses(), 8 * keys.len());
    }

    proptest::proptest! {
        #[test]
        fn misses_equal_distinct_keys(keys in proptest::collection::vec(0u8..6, 0..40)) {
            let cache: FingerprintCache<u8> = FingerprintCache::new();
            for &k in &keys {
                let (v, _) = cache
                    .get_or_compute(&fp(&k.to_string()), || Ok::<_, ()>(k))
                    .unwrap();
                proptest::prop_assert_eq!(v, k);
            }
            let mut distinct = keys.clone();
            distinct.sort_unstable();
            distinct.dedup();
            proptest::prop_assert_eq!(cache.misses(), distinct.len());
            proptest::prop_assert_eq!(cache.hits(), keys.len() - distinct.len());
            proptest::prop_assert_eq!(cache.len(), distinct.len());
        }
    }

    #[test]
    fn clear_forgets_everything() {
        let cache: FingerprintCache<u32> = FingerprintCache::new();
        cache.insert(&fp("c"), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.lookup(&fp("c")).is_none());
    }
}

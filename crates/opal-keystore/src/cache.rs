//! Bounded LRU cache over encrypted key-file contents.
//!
//! Entries are the raw envelope bytes as read from disk, so a memory dump
//! of a long-running proxy exposes no plaintext keys. Evicted buffers are
//! zeroed best-effort before they are dropped. The lock is held across a
//! miss so concurrent requests for the same key cause a single load.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use zeroize::Zeroize;

/// Cache sizing: `-1` disables, `0` unbounded, positive caps entries.
pub struct KeyCache {
    inner: Option<Mutex<LruCache<String, Vec<u8>>>>,
}

impl KeyCache {
    pub fn new(size: i64) -> Self {
        let inner = match size {
            -1 => None,
            0 => Some(Mutex::new(LruCache::unbounded())),
            n => Some(Mutex::new(LruCache::new(
                NonZeroUsize::new(n as usize).expect("positive cache size"),
            ))),
        };
        Self { inner }
    }

    pub fn enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Return the cached value for `name`, or run `load` and cache its
    /// result. With the cache disabled every call loads.
    pub fn get_or_load<E>(
        &self,
        name: &str,
        load: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<Vec<u8>, E> {
        let Some(inner) = self.inner.as_ref() else {
            return load();
        };
        let mut guard = inner.lock();
        if let Some(hit) = guard.get(name) {
            return Ok(hit.clone());
        }
        let value = load()?;
        if let Some((_, mut evicted)) = guard.push(name.to_string(), value.clone()) {
            evicted.zeroize();
        }
        Ok(value)
    }

    /// Drop every entry, wiping the buffers first.
    pub fn clear(&self) {
        if let Some(inner) = self.inner.as_ref() {
            let mut guard = inner.lock();
            while let Some((_, mut value)) = guard.pop_lru() {
                value.zeroize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn load(value: &[u8], opens: &mut usize) -> Result<Vec<u8>, Infallible> {
        *opens += 1;
        Ok(value.to_vec())
    }

    #[test]
    fn disabled_cache_loads_every_time() {
        let cache = KeyCache::new(-1);
        assert!(!cache.enabled());
        let mut opens = 0;
        for _ in 0..3 {
            cache.get_or_load("k", || load(b"v", &mut opens)).unwrap();
        }
        assert_eq!(opens, 3);
    }

    #[test]
    fn enabled_cache_loads_once() {
        let cache = KeyCache::new(0);
        let mut opens = 0;
        for _ in 0..3 {
            let v = cache.get_or_load("k", || load(b"v", &mut opens)).unwrap();
            assert_eq!(v, b"v");
        }
        assert_eq!(opens, 1);
    }

    #[test]
    fn bounded_cache_evicts_lru() {
        let cache = KeyCache::new(2);
        let mut opens = 0;
        cache.get_or_load("a", || load(b"1", &mut opens)).unwrap();
        cache.get_or_load("b", || load(b"2", &mut opens)).unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get_or_load("a", || load(b"1", &mut opens)).unwrap();
        cache.get_or_load("c", || load(b"3", &mut opens)).unwrap();
        assert_eq!(opens, 3);

        // "b" was evicted and must load again; "a" and "c" must not.
        cache.get_or_load("a", || load(b"1", &mut opens)).unwrap();
        cache.get_or_load("c", || load(b"3", &mut opens)).unwrap();
        cache.get_or_load("b", || load(b"2", &mut opens)).unwrap();
        assert_eq!(opens, 4);
    }

    #[test]
    fn clear_starts_a_new_epoch() {
        let cache = KeyCache::new(0);
        let mut opens = 0;
        cache.get_or_load("k", || load(b"v", &mut opens)).unwrap();
        cache.clear();
        cache.get_or_load("k", || load(b"v", &mut opens)).unwrap();
        assert_eq!(opens, 2);
    }
}

//! Per-key memoization for a single loader.
//!
//! There is no eviction policy: a cache belongs to one loader, and a loader
//! lives for one request. Entries only leave when they are cleared.

use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;

/// Maps each requested key to the handle of its (pending or completed) load.
#[derive(Debug)]
pub struct LoaderCache<Key, Handle> {
    entries: HashMap<Key, Handle>,
}

impl<Key, Handle> Default for LoaderCache<Key, Handle> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Key: Eq + Hash, Handle> LoaderCache<Key, Handle> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle previously stored for `key`, if any.
    pub fn get(&self, key: &Key) -> Option<&Handle> {
        self.entries.get(key)
    }

    /// Store `handle` for `key` unless one is already present. Returns the
    /// handle that is cached after the call, which is the existing one if
    /// there was one.
    pub fn set(&mut self, key: Key, handle: Handle) -> &Handle {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(handle),
        }
    }

    /// Get the handle for `key`, creating it with `make` the first time.
    pub fn get_or_insert_with(&mut self, key: Key, make: impl FnOnce(&Key) -> Handle) -> &mut Handle {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let handle = make(entry.key());
                entry.insert(handle)
            }
        }
    }

    /// Forget `key`, so that the next load for it is fetched again. Returns
    /// true if the key was cached.
    pub fn clear(&mut self, key: &Key) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Forget `key` only if its handle passes `check`, returning the removed
    /// handle.
    pub fn clear_if(&mut self, key: &Key, check: impl FnOnce(&Handle) -> bool) -> Option<Handle> {
        match self.entries.get(key) {
            Some(handle) if check(handle) => self.entries.remove(key),
            _ => None,
        }
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

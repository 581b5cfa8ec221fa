use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::future::{self, FutureExt, JoinAll, Ready, Shared};
use futures::ready;

use crate::{
    batch::{BatchController, BatchFn, BatchRules, Settle},
    cache::LoaderCache,
    window::Window,
};

type LoadResult<Key, Batcher> = Result<<Batcher as BatchFn<Key>>::Value, <Batcher as BatchFn<Key>>::Error>;

/// Where a handle gets its result from.
enum Source<Key, Batcher, Delay>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    Batch(Shared<Settle<Key, Batcher, Delay>>),
    Primed(Ready<LoadResult<Key, Batcher>>),
}

impl<Key, Batcher, Delay> Clone for Source<Key, Batcher, Delay>
where
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    fn clone(&self) -> Self {
        match self {
            Source::Batch(shared) => Source::Batch(shared.clone()),
            Source::Primed(ready) => Source::Primed(ready.clone()),
        }
    }
}

/// A memoized load. While the load is pending, `interest` counts the live
/// handles to it.
struct Entry<Key, Batcher, Delay>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    source: Source<Key, Batcher, Delay>,
    interest: Weak<()>,
}

type Cache<Key, Batcher, Delay> = Mutex<LoaderCache<Key, Entry<Key, Batcher, Delay>>>;

/// Links a handle back to the cache entry it was cloned from.
struct Tracker<Key, Batcher, Delay>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    key: Key,
    cache: Weak<Cache<Key, Batcher, Delay>>,
    interest: Arc<()>,
}

impl<Key, Batcher, Delay> Tracker<Key, Batcher, Delay>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    /// Remove our entry from the cache, if it is still there. With
    /// `only_if_last`, this only happens when no other handle to the entry
    /// is alive.
    fn forget(&self, only_if_last: bool) {
        let cache = match self.cache.upgrade() {
            Some(cache) => cache,
            None => return,
        };

        let ours = Arc::downgrade(&self.interest);
        let removed = cache.lock().unwrap().clear_if(&self.key, |entry| {
            Weak::ptr_eq(&entry.interest, &ours) && (!only_if_last || Arc::strong_count(&self.interest) == 1)
        });

        // The entry is dropped here, outside of the cache lock
        drop(removed);
    }
}

impl<Key, Batcher, Delay> Clone for Tracker<Key, Batcher, Delay>
where
    Key: Clone,
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            cache: Weak::clone(&self.cache),
            interest: Arc::clone(&self.interest),
        }
    }
}

/// The handle returned by [`Loader::load`]. It can be cloned and awaited any
/// number of times; every clone resolves to the same result.
///
/// Dropping every handle to a load that hasn't finished withdraws its key
/// from the batch, the same as dropping a [`BatchFuture`](crate::BatchFuture),
/// and removes it from the loader's cache.
pub struct LoadFuture<Key, Batcher, Delay>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    source: Source<Key, Batcher, Delay>,
    tracker: Option<Tracker<Key, Batcher, Delay>>,
}

impl<Key, Batcher, Delay> Unpin for LoadFuture<Key, Batcher, Delay>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
}

impl<Key, Batcher, Delay> Clone for LoadFuture<Key, Batcher, Delay>
where
    Key: Eq + Hash + Clone,
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<Key, Batcher, Delay> Debug for LoadFuture<Key, Batcher, Delay>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadFuture")
            .field("primed", &matches!(self.source, Source::Primed(..)))
            .field("cached", &self.tracker.is_some())
            .finish()
    }
}

impl<Key, Batcher, Delay> Future for LoadFuture<Key, Batcher, Delay>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    type Output = LoadResult<Key, Batcher>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        let settled = match unpinned.source {
            Source::Primed(ref mut ready) => return ready.poll_unpin(ctx),
            Source::Batch(ref mut shared) => ready!(shared.poll_unpin(ctx)),
        };

        // A batch that failed as a whole isn't memoized, so the next load of
        // this key fetches it again. Per-key errors stay cached.
        if settled.batch_failed {
            if let Some(ref tracker) = unpinned.tracker {
                tracker.forget(false);
            }
        }

        Poll::Ready(settled.result)
    }
}

impl<Key, Batcher, Delay> Drop for LoadFuture<Key, Batcher, Delay>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    fn drop(&mut self) {
        // The cache holds its own clone of the shared load, which would keep
        // the underlying BatchFuture (and its driver role) alive forever. The
        // last handle to an unfinished load takes it out of the cache, so
        // that the BatchFuture is dropped along with this handle.
        if let (Source::Batch(shared), Some(tracker)) = (&self.source, &self.tracker) {
            if shared.peek().is_none() {
                tracker.forget(true);
            }
        }
    }
}

/// A dataloader: a [`BatchController`] with a per-key memoization cache in
/// front of it. The first `load` of a key joins the current batch; every
/// later `load` of the same key gets a clone of that first handle, whether
/// it is still pending or already resolved.
///
/// A loader is meant to live exactly as long as one request. Its cache never
/// evicts anything on its own and is never shared, so a long-lived loader
/// would serve stale data across requests.
pub struct Loader<Key, Batcher, W>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    W: Window,
{
    controller: BatchController<Key, Batcher, W>,
    cache: Option<Arc<Cache<Key, Batcher, W::Delay>>>,
}

impl<Key, Batcher, W> Debug for Loader<Key, Batcher, W>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    W: Window,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("controller", &self.controller)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl<Key, Batcher, W> Loader<Key, Batcher, W>
where
    Key: Eq + Hash + Clone,
    Batcher: BatchFn<Key>,
    Batcher::Value: Clone,
    Batcher::Error: Clone,
    W: Window,
{
    /// Create a memoizing loader.
    pub fn new(rules: BatchRules<Batcher, W>) -> Self {
        Self {
            controller: BatchController::new(rules),
            cache: Some(Arc::new(Mutex::new(LoaderCache::new()))),
        }
    }

    /// Create a loader without memoization. Every `load` joins the current
    /// batch, so a key requested twice is passed to the batch function twice.
    pub fn uncached(rules: BatchRules<Batcher, W>) -> Self {
        Self {
            controller: BatchController::new(rules),
            cache: None,
        }
    }

    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    /// Load the value for a single key.
    pub fn load(&self, key: Key) -> LoadFuture<Key, Batcher, W::Delay> {
        let controller = &self.controller;

        let cache = match self.cache {
            None => {
                return LoadFuture {
                    source: Source::Batch(controller.load(key).settle().shared()),
                    tracker: None,
                }
            }
            Some(ref cache) => cache,
        };

        let mut guard = cache.lock().unwrap();
        let entry = guard.get_or_insert_with(key.clone(), |key| Entry {
            source: Source::Batch(controller.load(key.clone()).settle().shared()),
            interest: Weak::new(),
        });

        let source = entry.source.clone();
        let tracker = match source {
            Source::Primed(..) => None,
            Source::Batch(..) => {
                let interest = entry.interest.upgrade().unwrap_or_else(|| {
                    let interest = Arc::new(());
                    entry.interest = Arc::downgrade(&interest);
                    interest
                });

                Some(Tracker {
                    key,
                    cache: Arc::downgrade(cache),
                    interest,
                })
            }
        };
        drop(guard);

        LoadFuture { source, tracker }
    }

    /// Load several keys at once. The results are in the same order as
    /// `keys`.
    pub fn load_many(&self, keys: impl IntoIterator<Item = Key>) -> JoinAll<LoadFuture<Key, Batcher, W::Delay>> {
        future::join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Seed the cache with a value that is already known, e.g. a row that a
    /// mutation just wrote. Does nothing if the key is already cached, or if
    /// this loader doesn't cache. Returns true if the value was stored.
    pub fn prime(&self, key: Key, value: Batcher::Value) -> bool {
        match self.cache {
            None => false,
            Some(ref cache) => {
                let mut cache = cache.lock().unwrap();
                if cache.get(&key).is_some() {
                    return false;
                }

                cache.set(
                    key,
                    Entry {
                        source: Source::Primed(future::ready(Ok(value))),
                        interest: Weak::new(),
                    },
                );
                true
            }
        }
    }

    /// Forget a cached key, so that its next `load` is fetched again.
    pub fn clear(&self, key: &Key) -> bool {
        match self.cache {
            None => false,
            Some(ref cache) => cache.lock().unwrap().clear(key),
        }
    }

    /// Forget every cached key.
    pub fn clear_all(&self) {
        if let Some(ref cache) = self.cache {
            cache.lock().unwrap().clear_all();
        }
    }

    /// Number of keys currently memoized.
    pub fn cached_len(&self) -> usize {
        match self.cache {
            None => 0,
            Some(ref cache) => cache.lock().unwrap().len(),
        }
    }

    /// Close the current batch window now. See [`BatchController::dispatch`].
    pub fn dispatch(&self) {
        self.controller.dispatch();
    }
}

use std::{any::Any, fmt::Debug, marker::PhantomData, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::{
    fingerprint::{Fingerprint, FingerprintError},
    source::SourceId,
};

type ErasedCache = Arc<dyn Any + Send + Sync>;

/// Keeps one cache per source function, keyed by the fingerprint of the arguments.
///
/// The store is a plain value: construct one, share it (usually behind an `Arc`)
/// and drop it when the cached data is no longer needed.
#[derive(Default)]
pub struct ResourceStore {
    caches: DashMap<SourceId, ErasedCache>,
}

/// All entries belonging to a single source function.
struct SourceCache<V> {
    entries: DashMap<Fingerprint, V>,
}

impl<V> Default for SourceCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error("The cache of {source_id} holds entries of a different type")]
    #[diagnostic(
        code(async_resource::store::entry_type_mismatch),
        help("A source function's cache must always be accessed with the same entry type")
    )]
    EntryTypeMismatch { source_id: SourceId },
}

/// Outcome of [`ResourceCache::get_or_insert_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// An entry was already published under these arguments.
    Hit(V),
    /// No entry existed, the new one is now published.
    Inserted(V),
}

impl<V> Lookup<V> {
    pub fn into_inner(self) -> V {
        match self {
            Lookup::Hit(v) | Lookup::Inserted(v) => v,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache handle for one source function.
    ///
    /// Handles are cheap and hold no state of their own, every operation goes
    /// through the store. A handle taken before [`ResourceCache::clear`] keeps working.
    pub fn resource_cache<V>(&self, source: SourceId) -> ResourceCache<'_, V>
    where
        V: Clone + Send + Sync + 'static,
    {
        ResourceCache {
            store: self,
            source,
            _entry: PhantomData,
        }
    }

    pub fn contains_source(&self, source: SourceId) -> bool {
        self.caches.contains_key(&source)
    }

    /// Number of source functions with a live cache.
    pub fn sources(&self) -> usize {
        self.caches.len()
    }

    /// Drops the caches of every source function.
    pub fn clear_all(&self) {
        trace!(sources = self.caches.len(), "Clearing all caches");
        self.caches.clear();
    }
}

impl Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("sources", &self.caches.len())
            .finish()
    }
}

pub struct ResourceCache<'s, V> {
    store: &'s ResourceStore,
    source: SourceId,
    _entry: PhantomData<fn() -> V>,
}

impl<'s, V> ResourceCache<'s, V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn source(&self) -> SourceId {
        self.source
    }

    fn downcast(&self, erased: ErasedCache) -> Result<Arc<SourceCache<V>>, StoreError> {
        erased
            .downcast::<SourceCache<V>>()
            .map_err(|_| StoreError::EntryTypeMismatch {
                source_id: self.source,
            })
    }

    fn existing(&self) -> Result<Option<Arc<SourceCache<V>>>, StoreError> {
        let erased = self
            .store
            .caches
            .get(&self.source)
            .map(|cache| Arc::clone(cache.value()));

        erased.map(|erased| self.downcast(erased)).transpose()
    }

    /// Runs `op` on this source's cache while the store still links it, creating it if needed.
    ///
    /// The slot stays read-locked while `op` runs, so a concurrent [`Self::clear`]
    /// can't unlink the cache halfway through and strand what `op` publishes.
    fn with_linked<R>(&self, op: impl FnOnce(&SourceCache<V>) -> R) -> Result<R, StoreError> {
        loop {
            if let Some(slot) = self.store.caches.get(&self.source) {
                let erased: &(dyn Any + Send + Sync) = &**slot.value();
                let cache = erased.downcast_ref::<SourceCache<V>>().ok_or(
                    StoreError::EntryTypeMismatch {
                        source_id: self.source,
                    },
                )?;
                return Ok(op(cache));
            }

            // A clear may unlink the new cache before we read it back, hence the loop
            self.store.caches.entry(self.source).or_insert_with(|| {
                trace!(source = %self.source, "Creating source cache");
                Arc::new(SourceCache::<V>::default()) as ErasedCache
            });
        }
    }

    /// Entry published under `args`, if any.
    pub fn get<A: Serialize + ?Sized>(&self, args: &A) -> Result<Option<V>, StoreError> {
        let key = Fingerprint::of(args)?;
        let Some(cache) = self.existing()? else {
            return Ok(None);
        };

        Ok(cache.entries.get(&key).map(|entry| entry.value().clone()))
    }

    /// Publishes `value` under `args`, replacing whatever was there.
    pub fn set<A: Serialize + ?Sized>(&self, value: V, args: &A) -> Result<(), StoreError> {
        let key = Fingerprint::of(args)?;

        trace!(source = %self.source, %key, "Publishing entry");
        self.with_linked(|cache| {
            cache.entries.insert(key, value);
        })
    }

    /// Removes the entry under `args`, returns whether there was one.
    pub fn delete<A: Serialize + ?Sized>(&self, args: &A) -> Result<bool, StoreError> {
        let key = Fingerprint::of(args)?;
        let Some(cache) = self.existing()? else {
            return Ok(false);
        };

        let removed = cache.entries.remove(&key).is_some();
        trace!(source = %self.source, %key, removed, "Deleting entry");
        Ok(removed)
    }

    /// Drops every entry of this source function, including its slot in the store.
    pub fn clear(&self) {
        trace!(source = %self.source, "Clearing source cache");
        let Some((_, erased)) = self.store.caches.remove(&self.source) else {
            return;
        };

        // Someone may still hold the `Arc` we just unlinked
        if let Ok(cache) = self.downcast(erased) {
            cache.entries.clear();
        }
    }

    /// Returns the entry under `args`, or publishes the one `init` builds from them.
    ///
    /// Lookup and publication happen under the same shard lock, so two
    /// concurrent callers never both see a miss for the same key. `init` gets
    /// the key and the arguments. It runs while the lock is held and must not
    /// access the store.
    pub fn get_or_insert_with<A, F>(&self, args: A, init: F) -> Result<Lookup<V>, StoreError>
    where
        A: Serialize,
        F: FnOnce(Fingerprint, A) -> V,
    {
        let key = Fingerprint::of(&args)?;

        self.with_linked(|cache| match cache.entries.entry(key) {
            Entry::Occupied(entry) => Lookup::Hit(entry.get().clone()),
            Entry::Vacant(entry) => {
                trace!(source = %self.source, %key, "Publishing entry");
                Lookup::Inserted(entry.insert(init(key, args)).value().clone())
            }
        })
    }

    /// Number of entries currently published for this source function.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self
            .existing()?
            .map_or(0, |cache| cache.entries.len()))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

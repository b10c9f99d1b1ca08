use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    loader::{InitError, Resources},
    reader::{DataReader, Read},
    source::SourceFn,
};

/// A slot that may or may not hold a reader for `source` yet.
///
/// Reads return `None` until [`LazyReader::update`] has been called. Each update
/// swaps in the reader for the new arguments, going through the cache, so
/// switching back to earlier arguments reuses their reader.
pub struct LazyReader<A, T, E> {
    resources: Resources,
    source: SourceFn<A, T, E>,
    current: Mutex<Option<DataReader<T, E>>>,
}

impl<A, T, E> LazyReader<A, T, E>
where
    A: Serialize,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(resources: Resources, source: SourceFn<A, T, E>) -> Self {
        Self {
            resources,
            source,
            current: Mutex::new(None),
        }
    }

    /// A slot that starts with the reader for `args`.
    pub fn eager(resources: Resources, source: SourceFn<A, T, E>, args: A) -> Result<Self, InitError> {
        let slot = Self::new(resources, source);
        slot.update(args)?;
        Ok(slot)
    }

    pub fn update(&self, args: A) -> Result<DataReader<T, E>, InitError> {
        let reader = self.resources.initialize(&self.source, args)?;
        *self.current.lock() = Some(reader.clone());
        Ok(reader)
    }

    pub fn current(&self) -> Option<DataReader<T, E>> {
        self.current.lock().clone()
    }

    pub fn read(&self) -> Option<Read<T, E>>
    where
        T: Clone,
    {
        self.current().map(|reader| reader.read())
    }

    pub fn read_with<M>(&self, projection: impl FnOnce(&T) -> M) -> Option<Read<M, E>> {
        self.current().map(|reader| reader.read_with(projection))
    }
}

use std::sync::Arc;

use async_resource_core::{ResourceCache, ResourceStore, StoreError};
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, debug_span, trace};

use crate::{reader::DataReader, source::SourceFn};

#[derive(Debug, Error, Diagnostic)]
pub enum InitError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
    #[error("No tokio runtime to drive the source function")]
    #[diagnostic(
        code(async_resource::init::no_runtime),
        help("Call from within a tokio runtime or pass a handle to `Resources::builder().runtime(..)`")
    )]
    NoRuntime,
}

/// Returns the reader cached for `source` and `args`, creating it on a miss.
///
/// A hit is returned as-is, whatever its state. On a miss the source function
/// is invoked once, on the ambient tokio runtime, and the pending reader is
/// published before this returns.
pub fn initialize_data_reader<A, T, E>(
    store: &ResourceStore,
    source: &SourceFn<A, T, E>,
    args: A,
) -> Result<DataReader<T, E>, InitError>
where
    A: Serialize,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let runtime = Handle::try_current().map_err(|_| InitError::NoRuntime)?;
    initialize_on(store, &runtime, source, args)
}

/// Same as [`initialize_data_reader`], for warming the cache ahead of a read.
pub fn preload<A, T, E>(
    store: &ResourceStore,
    source: &SourceFn<A, T, E>,
    args: A,
) -> Result<DataReader<T, E>, InitError>
where
    A: Serialize,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    initialize_data_reader(store, source, args)
}

fn initialize_on<A, T, E>(
    store: &ResourceStore,
    runtime: &Handle,
    source: &SourceFn<A, T, E>,
    args: A,
) -> Result<DataReader<T, E>, InitError>
where
    A: Serialize,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let cache = store.resource_cache::<DataReader<T, E>>(source.id());

    let lookup = cache.get_or_insert_with(args, |key, args| {
        // The reader logs its settlement inside this span
        debug_span!("data_reader", source = %source.id(), %key).in_scope(|| {
            debug!("Cache miss, invoking source function");
            DataReader::spawn(source.call(args), runtime)
        })
    })?;

    if lookup.is_hit() {
        trace!(source = %source.id(), "Cache hit");
    }

    Ok(lookup.into_inner())
}

/// A store bundled with the runtime its source functions run on.
#[derive(Debug, Clone)]
pub struct Resources {
    store: Arc<ResourceStore>,
    runtime: Handle,
}

#[derive(Debug, Default)]
pub struct ResourcesBuilder {
    store: Option<Arc<ResourceStore>>,
    runtime: Option<Handle>,
}

impl ResourcesBuilder {
    /// Share an existing store instead of starting with an empty one.
    pub fn store(mut self, store: Arc<ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runtime to spawn source functions on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Resources, InitError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| InitError::NoRuntime)?,
        };

        Ok(Resources {
            store: self.store.unwrap_or_default(),
            runtime,
        })
    }
}

impl Resources {
    /// Empty store on the current runtime.
    pub fn new() -> Result<Self, InitError> {
        Self::builder().build()
    }

    pub fn builder() -> ResourcesBuilder {
        ResourcesBuilder::default()
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn initialize<A, T, E>(
        &self,
        source: &SourceFn<A, T, E>,
        args: A,
    ) -> Result<DataReader<T, E>, InitError>
    where
        A: Serialize,
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        initialize_on(&self.store, &self.runtime, source, args)
    }

    pub fn preload<A, T, E>(
        &self,
        source: &SourceFn<A, T, E>,
        args: A,
    ) -> Result<DataReader<T, E>, InitError>
    where
        A: Serialize,
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.initialize(source, args)
    }

    /// The cache holding `source`'s readers.
    pub fn resource_cache<A, T, E>(
        &self,
        source: &SourceFn<A, T, E>,
    ) -> ResourceCache<'_, DataReader<T, E>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.store.resource_cache(source.id())
    }

    /// Evicts the reader for `args`, the next initialization calls `source` again.
    pub fn invalidate<A, T, E>(&self, source: &SourceFn<A, T, E>, args: &A) -> Result<bool, InitError>
    where
        A: Serialize,
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Ok(self.resource_cache(source).delete(args)?)
    }

    /// Evicts every reader of `source`.
    pub fn clear<A, T, E>(&self, source: &SourceFn<A, T, E>)
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.resource_cache(source).clear();
    }
}

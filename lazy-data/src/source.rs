use std::{fmt::Debug, future::Future, pin::Pin, sync::Arc};

use async_resource_core::SourceId;

pub type BoxFut<'a, O> = Pin<Box<dyn Future<Output = O> + Send + 'a>>;

type SourceCall<A, T, E> = dyn Fn(A) -> BoxFut<'static, Result<T, E>> + Send + Sync;

/// An async operation whose results get cached per argument tuple.
///
/// Wrapping a function assigns it a fresh [`SourceId`]. Clones share that id,
/// and with it the cache.
pub struct SourceFn<A, T, E> {
    id: SourceId,
    f: Arc<SourceCall<A, T, E>>,
}

impl<A, T, E> SourceFn<A, T, E>
where
    A: 'static,
    T: 'static,
    E: 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            id: SourceId::next(),
            f: Arc::new(move |args| -> BoxFut<'static, Result<T, E>> { Box::pin(f(args)) }),
        }
    }
}

impl<A, T, E> SourceFn<A, T, E> {
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Invokes the wrapped function, bypassing any cache.
    pub fn call(&self, args: A) -> BoxFut<'static, Result<T, E>> {
        (self.f)(args)
    }
}

impl<A, T, E> Clone for SourceFn<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            f: Arc::clone(&self.f),
        }
    }
}

impl<A, T, E> Debug for SourceFn<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SourceFn").field(&self.id).finish()
    }
}

use std::{
    any::Any,
    error::Error,
    fmt::{self, Debug, Display},
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, Instrument, Span};

use crate::source::BoxFut;

/// Failure captured by a [`DataReader`].
///
/// Every read of a failed reader hands out the same captured error.
#[derive(Debug)]
pub enum ReadError<E> {
    Source(Arc<E>),
    Panicked(Arc<str>),
}

impl<E> ReadError<E> {
    /// The error the source function returned, if that is what happened.
    pub fn as_source(&self) -> Option<&E> {
        match self {
            ReadError::Source(err) => Some(err.as_ref()),
            ReadError::Panicked(_) => None,
        }
    }
}

impl<E: Display> Display for ReadError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Source(err) => Display::fmt(err, f),
            ReadError::Panicked(msg) => write!(f, "Source function panicked: {msg}"),
        }
    }
}

// Transparent over the source error
impl<E: Error + 'static> Error for ReadError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReadError::Source(err) => err.source(),
            ReadError::Panicked(_) => None,
        }
    }
}

// Derive would require `E: Clone`
impl<E> Clone for ReadError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Source(err) => Self::Source(Arc::clone(err)),
            Self::Panicked(msg) => Self::Panicked(Arc::clone(msg)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Resolved,
    Failed,
}

/// Completes once the operation behind a reader has settled.
///
/// Returned by reads of a pending reader; await it, then read again.
#[derive(Clone)]
#[must_use = "a suspension does nothing unless awaited"]
pub struct Suspension {
    settled: Shared<BoxFut<'static, ()>>,
}

impl Suspension {
    fn new(settle: BoxFut<'static, ()>) -> Self {
        Self {
            settled: settle.shared(),
        }
    }

    fn ready() -> Self {
        Self::new(Box::pin(futures::future::ready(())))
    }
}

impl Future for Suspension {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.settled.poll_unpin(cx)
    }
}

impl Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("settled", &self.settled.peek().is_some())
            .finish()
    }
}

/// Result of a synchronous read.
#[must_use]
#[derive(Debug)]
pub enum Read<V, E> {
    /// Still pending, retry after the suspension completes.
    Suspended(Suspension),
    Resolved(V),
    Failed(ReadError<E>),
}

impl<V, E> Read<V, E> {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Read::Suspended(_))
    }

    pub fn ok(self) -> Option<V> {
        match self {
            Read::Resolved(v) => Some(v),
            _ => None,
        }
    }

    pub fn err(self) -> Option<ReadError<E>> {
        match self {
            Read::Failed(err) => Some(err),
            _ => None,
        }
    }
}

enum State<T, E> {
    Pending,
    Resolved(Arc<T>),
    Failed(ReadError<E>),
}

impl<T, E> State<T, E> {
    fn status(&self) -> Status {
        match self {
            State::Pending => Status::Pending,
            State::Resolved(_) => Status::Resolved,
            State::Failed(_) => Status::Failed,
        }
    }
}

struct ReaderInner<T, E> {
    state: Mutex<State<T, E>>,
}

impl<T, E> ReaderInner<T, E> {
    fn settle(&self, outcome: Result<Result<T, E>, Box<dyn Any + Send>>) {
        let next = match outcome {
            Ok(Ok(value)) => State::Resolved(Arc::new(value)),
            Ok(Err(err)) => State::Failed(ReadError::Source(Arc::new(err))),
            Err(panic) => State::Failed(ReadError::Panicked(panic_message(panic.as_ref()))),
        };

        debug!(status = ?next.status(), "Data reader settled");

        let mut state = self.state.lock();
        // Resolved and Failed are terminal
        if let State::Pending = *state {
            *state = next;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> Arc<str> {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        Arc::from(*msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        Arc::from(msg.as_str())
    } else {
        Arc::from("Box<dyn Any>")
    }
}

/// One invocation of a source function, readable synchronously.
///
/// A reader starts out pending and settles exactly once, either resolved with
/// the value or failed with the error. Clones share that state, equality is
/// reference equality.
pub struct DataReader<T, E> {
    inner: Arc<ReaderInner<T, E>>,
    settled: Suspension,
}

impl<T, E> DataReader<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Starts driving `fut` on `runtime` and returns a pending reader for it.
    ///
    /// The operation runs to completion whether or not anyone awaits it, inside
    /// the span that is current here. The reader is not published anywhere.
    pub fn spawn<F>(fut: F, runtime: &Handle) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let inner = Arc::new(ReaderInner {
            state: Mutex::new(State::Pending),
        });

        // The continuation only holds a weak reference, so a pending reader
        // that nobody holds anymore can be dropped.
        let weak = Arc::downgrade(&inner);
        let settled = Suspension::new(Box::pin(
            async move {
                let outcome = AssertUnwindSafe(fut).catch_unwind().await;
                if let Some(inner) = weak.upgrade() {
                    inner.settle(outcome);
                }
            }
            .instrument(Span::current()),
        ));

        runtime.spawn(settled.clone());

        Self { inner, settled }
    }

    /// A reader that is already resolved with `value`.
    pub fn from_value(value: T) -> Self {
        Self::from_state(State::Resolved(Arc::new(value)))
    }

    /// A reader that has already failed with `err`.
    pub fn from_error(err: E) -> Self {
        Self::from_state(State::Failed(ReadError::Source(Arc::new(err))))
    }

    fn from_state(state: State<T, E>) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                state: Mutex::new(state),
            }),
            settled: Suspension::ready(),
        }
    }
}

impl<T, E> DataReader<T, E> {
    pub fn status(&self) -> Status {
        self.inner.state.lock().status()
    }

    /// `None` while pending.
    fn outcome(&self) -> Option<Result<Arc<T>, ReadError<E>>> {
        match &*self.inner.state.lock() {
            State::Pending => None,
            State::Resolved(value) => Some(Ok(Arc::clone(value))),
            State::Failed(err) => Some(Err(err.clone())),
        }
    }

    /// Reads the value as-is.
    pub fn read(&self) -> Read<T, E>
    where
        T: Clone,
    {
        self.read_with(T::clone)
    }

    /// Reads the value through `projection`.
    ///
    /// The projection runs on every resolved read and never touches the
    /// reader's state: if it panics, later reads still see the same value.
    pub fn read_with<M>(&self, projection: impl FnOnce(&T) -> M) -> Read<M, E> {
        match self.outcome() {
            None => Read::Suspended(self.settled.clone()),
            Some(Ok(value)) => Read::Resolved(projection(&value)),
            Some(Err(err)) => Read::Failed(err),
        }
    }

    /// Waits until the reader has settled, then reads it.
    pub async fn resolve(&self) -> Result<T, ReadError<E>>
    where
        T: Clone,
    {
        self.resolve_with(T::clone).await
    }

    pub async fn resolve_with<M>(&self, projection: impl FnOnce(&T) -> M) -> Result<M, ReadError<E>> {
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome.map(|value| projection(&value));
            }
            self.settled.clone().await;
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, E> Clone for DataReader<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            settled: self.settled.clone(),
        }
    }
}

// (Partial)Eq uses reference equality, not value equality
impl<T, E> PartialEq for DataReader<T, E> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T, E> Eq for DataReader<T, E> {}

impl<T, E> Debug for DataReader<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataReader")
            .field("addr", &Arc::as_ptr(&self.inner))
            .field("status", &self.status())
            .finish()
    }
}

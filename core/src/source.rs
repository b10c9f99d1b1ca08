use std::sync::atomic::{AtomicUsize, Ordering};

use derive_more::Display;

/// Identity of a source function.
///
/// Ids are handed out once per wrapped function and never reused within a
/// process, so two functions never share a cache even if their code is identical.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display(fmt = "source#{}", _0)]
pub struct SourceId(usize);

static NEXT_SOURCE_ID: AtomicUsize = AtomicUsize::new(0);

impl SourceId {
    pub fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

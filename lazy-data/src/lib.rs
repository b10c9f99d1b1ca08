// #![warn(clippy::pedantic)]

// #![warn(clippy::nursery)]
// #![warn(clippy::cargo)]
#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::dbg_macro)]

// #![warn(clippy::unwrap_used)]
// #![warn(clippy::expect_used)]

pub mod lazy;
pub mod loader;
pub mod reader;
pub mod source;

#[cfg(test)]
mod loader_test;

pub use async_resource_core::{
    Fingerprint, FingerprintError, Lookup, ResourceCache, ResourceStore, SourceId, StoreError,
};
pub use lazy::LazyReader;
pub use loader::{initialize_data_reader, preload, InitError, Resources, ResourcesBuilder};
pub use reader::{DataReader, Read, ReadError, Status, Suspension};
pub use source::{BoxFut, SourceFn};

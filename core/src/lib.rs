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

pub mod fingerprint;
pub mod source;
pub mod store;

pub use fingerprint::{Fingerprint, FingerprintError};
pub use source::SourceId;
pub use store::{Lookup, ResourceCache, ResourceStore, StoreError};

//! Fault resolution, hydration and prefetching
//!
//! Fetched rows always pass through the snapshot store before they reach an
//! object, so every object state is backed by a row that was actually
//! observed.

mod fault;
mod hydrate;
mod prefetch;
mod select;

pub(crate) use fault::Need;
pub use select::{FetchSpec, PrefetchSemantics};

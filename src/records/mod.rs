//! In-memory record collections.
//!
//! Each collection keeps its records in insertion order with an id index
//! for O(1) lookups. Insertion order is what ties are broken by when a
//! query sorts.

mod collection;

pub use collection::Collection;

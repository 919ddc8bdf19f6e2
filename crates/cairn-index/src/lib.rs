//! Content index map for the Cairn object database.
//!
//! Objects are addressed by hash; the index map lets callers address them by
//! a meaningful name instead. Each backend contributes one
//! [`ContentIndexMap`] slice, and the database merges all of them into a
//! single [`DatabaseIndexMap`] where at most one slice is writable.
//!
//! # Key Types
//!
//! - [`ContentIndexMap`] -- one name → id slice, optionally backed by an index file
//! - [`DatabaseIndexMap`] -- merged view over every slice plus bundle names
//! - [`IndexRecord`] -- one line of the on-disk index file
//!
//! # Merge policy
//!
//! Merging is last-writer-wins: an entry merged later shadows an earlier
//! entry for the same name.

pub mod error;
pub mod file;
pub mod map;
pub mod merged;

pub use error::{IndexError, IndexResult};
pub use file::IndexRecord;
pub use map::ContentIndexMap;
pub use merged::DatabaseIndexMap;

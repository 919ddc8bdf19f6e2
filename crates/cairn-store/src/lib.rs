//! Storage backends for the Cairn object database.
//!
//! A backend is a pluggable storage unit keyed by [`ObjectId`]. Every
//! backend implements the [`Backend`] trait; the object database layers up
//! to three of them behind one facade.
//!
//! # Backends
//!
//! - [`LooseFileBackend`] -- one file per object under a hex fan-out directory
//! - [`InMemoryBackend`] -- `HashMap`-based store for tests and embedding
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written (content-addressing guarantees this).
//! 2. Write-then-link: an object is durable before anything names it.
//! 3. Concurrent reads are always safe.
//! 4. Concurrent writes of the same id are benign: they carry identical bytes.
//! 5. Backends never interpret object contents.
//! 6. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod loose;
pub mod memory;
pub mod stream;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use loose::LooseFileBackend;
pub use memory::InMemoryBackend;
pub use stream::{FileAccess, ObjectRead, ObjectReadWrite, ObjectReader, ObjectWriter, OpenMode};
pub use traits::Backend;

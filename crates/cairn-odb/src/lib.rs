//! Cairn object database.
//!
//! [`ObjectDatabase`] is the facade applications talk to. It layers up to
//! three storage units behind one content-addressed namespace:
//!
//! 1. every loaded bundle (read-only, see [`cairn_bundle`])
//! 2. the primary [`Backend`]
//! 3. an optional overflow [`Backend`], written to when the primary is
//!    read-only
//!
//! Names resolve through one merged index over all layers. Objects read into
//! memory are shared through a reference-counted [`BlobCache`].
//!
//! ```no_run
//! # async fn demo() -> cairn_odb::DatabaseResult<()> {
//! use cairn_odb::{CancellationToken, DatabaseConfig, ObjectDatabase};
//!
//! let db = ObjectDatabase::from_config(&DatabaseConfig::new("objects"))?;
//! db.initialize(&CancellationToken::new()).await?;
//! let id = db.write_named("greeting", b"hello")?;
//! assert_eq!(db.resolve("greeting"), Some(id));
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod config;
pub mod database;
pub mod error;

pub use blob::{Blob, BlobCache, BlobReader};
pub use config::DatabaseConfig;
pub use database::{ObjectDatabase, ObjectDatabaseBuilder, ObjectStream, DEFAULT_BUNDLE};
pub use error::{DatabaseError, DatabaseResult};

pub use cairn_bundle::{BundleOptions, BundleReport};
pub use cairn_index::DatabaseIndexMap;
pub use cairn_store::{Backend, FileAccess, InMemoryBackend, LooseFileBackend, OpenMode};
pub use cairn_types::ObjectId;
pub use tokio_util::sync::CancellationToken;

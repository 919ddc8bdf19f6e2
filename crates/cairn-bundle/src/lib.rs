//! Bundle containers for the Cairn object database.
//!
//! A bundle packs many objects into one file so they can be shipped and
//! opened as a unit. Loaded bundles are served through [`BundleBackend`],
//! which layers every loaded bundle into one resolution table.
//!
//! # Architecture
//!
//! - **Bundle file** (`<name>.bundle`): fixed header, bincode manifest, then
//!   the zstd-compressed (or raw) payload of every object
//! - **Incremental files** (`<name>.<hex>.bundle`): payload-only companions
//!   reused across rebuilds when most of their content is still wanted
//! - [`create_bundle`]: packs objects from any [`cairn_store::Backend`]
//! - [`BundleBackend`]: load-counted loading with dependencies and
//!   transparent decompression on read

pub mod backend;
pub mod error;
pub mod format;
pub mod reader;
pub mod writer;

pub use backend::{BundleBackend, ObjectLocation};
pub use error::{BundleError, BundleResult};
pub use format::{BundleDescription, BundleHeader, ObjectInfo, BUNDLE_EXTENSION};
pub use reader::RangeReader;
pub use writer::{create_bundle, incremental_path, BundleOptions, BundleReport};

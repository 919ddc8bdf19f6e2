//! Foundation types for the Cairn object database.
//!
//! Every other Cairn crate depends on `cairn-types`. It defines the universal
//! key of the database and the streaming hash that produces it.
//!
//! # Key Types
//!
//! - [`ObjectId`] -- Content-addressed identifier (BLAKE3 hash of the bytes)
//! - [`ObjectIdBuilder`] -- Incremental hash accumulator producing an `ObjectId`
//! - [`HashingReader`] -- `Read` adapter that hashes everything flowing through it

pub mod error;
pub mod hasher;
pub mod object;

pub use error::TypeError;
pub use hasher::{HashingReader, ObjectIdBuilder};
pub use object::ObjectId;

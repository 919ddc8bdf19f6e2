//! Stream types handed out by backends.

use std::fs::OpenOptions;
use std::io::{Read, Seek, Write};

/// A readable, seekable object stream.
pub trait ObjectRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> ObjectRead for T {}

/// A readable, writable, seekable object stream.
pub trait ObjectReadWrite: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ObjectReadWrite for T {}

/// Boxed read stream over one object.
pub type ObjectReader = Box<dyn ObjectRead>;

/// Boxed read-write stream over one object.
pub type ObjectWriter = Box<dyn ObjectReadWrite>;

/// How an object stream is opened for writing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Open existing content; fails if the object does not exist.
    #[default]
    Open,
    /// Create, replacing existing content.
    Create,
    /// Create; fails if the object exists.
    CreateNew,
    /// Open existing content or create it empty.
    OpenOrCreate,
    /// Open existing content and discard it.
    Truncate,
    /// Open or create, positioned at the end.
    Append,
}

impl OpenMode {
    /// Whether opening in this mode keeps an object's existing bytes.
    pub fn preserves_content(self) -> bool {
        matches!(self, Self::Open | Self::OpenOrCreate | Self::Append)
    }

    /// Whether opening in this mode may create the object.
    pub fn may_create(self) -> bool {
        matches!(
            self,
            Self::Create | Self::CreateNew | Self::OpenOrCreate | Self::Append
        )
    }

    /// Equivalent `OpenOptions` for a read-write file handle.
    pub fn to_open_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        match self {
            Self::Open => {}
            Self::Create => {
                options.create(true).truncate(true);
            }
            Self::CreateNew => {
                options.create_new(true);
            }
            Self::OpenOrCreate | Self::Append => {
                options.create(true);
            }
            Self::Truncate => {
                options.truncate(true);
            }
        }
        options
    }
}

/// Requested access for a database stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileAccess {
    #[default]
    Read,
    Write,
    ReadWrite,
}

impl FileAccess {
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

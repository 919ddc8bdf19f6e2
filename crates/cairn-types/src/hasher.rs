use std::io::{self, Read};

use crate::object::ObjectId;

const READ_CHUNK: usize = 64 * 1024;

/// Incremental BLAKE3 accumulator producing an [`ObjectId`].
///
/// Content hashing is a streaming operation: bytes are fed in as they become
/// available and the whole object never has to be resident at once.
/// Feeding the same byte sequence in any chunking yields the same id as
/// [`ObjectId::from_bytes`].
#[derive(Clone, Default)]
pub struct ObjectIdBuilder {
    hasher: blake3::Hasher,
    len: u64,
}

impl ObjectIdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(data);
        self.len += data.len() as u64;
        self
    }

    /// Feed everything a reader yields until EOF.
    pub fn update_reader<R: Read>(&mut self, mut reader: R) -> io::Result<&mut Self> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.update(&buf[..n]);
        }
        Ok(self)
    }

    /// Number of bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.len
    }

    /// Finish hashing and return the id.
    pub fn finalize(&self) -> ObjectId {
        ObjectId::from_hash(*self.hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for ObjectIdBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectIdBuilder")
            .field("bytes_hashed", &self.len)
            .finish()
    }
}

/// `Read` adapter that hashes every byte it hands out.
///
/// Used to compute an object's id while copying it into storage, so the
/// source is only read once.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    builder: ObjectIdBuilder,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            builder: ObjectIdBuilder::new(),
        }
    }

    /// Bytes read through the adapter so far.
    pub fn bytes_read(&self) -> u64 {
        self.builder.bytes_hashed()
    }

    /// The id of everything read so far.
    pub fn object_id(&self) -> ObjectId {
        self.builder.finalize()
    }

    /// Consume the adapter, returning the inner reader and the id.
    pub fn into_parts(self) -> (R, ObjectId) {
        let id = self.builder.finalize();
        (self.inner, id)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.builder.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_builder_matches_empty_hash() {
        let builder = ObjectIdBuilder::new();
        assert_eq!(builder.finalize(), ObjectId::from_bytes(b""));
        assert_eq!(builder.bytes_hashed(), 0);
    }

    #[test]
    fn chunked_updates_match_one_shot() {
        let mut builder = ObjectIdBuilder::new();
        builder.update(b"hello ").update(b"world");
        assert_eq!(builder.finalize(), ObjectId::from_bytes(b"hello world"));
        assert_eq!(builder.bytes_hashed(), 11);
    }

    #[test]
    fn hashing_reader_hashes_while_copying() {
        let data = vec![0x5Au8; 200_000];
        let mut reader = HashingReader::new(data.as_slice());
        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();

        assert_eq!(sink, data);
        assert_eq!(reader.bytes_read(), 200_000);
        let (_, id) = reader.into_parts();
        assert_eq!(id, ObjectId::from_bytes(&data));
    }

    #[test]
    fn partial_read_hashes_only_consumed_bytes() {
        let mut reader = HashingReader::new(&b"abcdef"[..]);
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.object_id(), ObjectId::from_bytes(b"abc"));
    }

    proptest! {
        #[test]
        fn any_split_point_gives_same_id(data in proptest::collection::vec(any::<u8>(), 0..4096), split in 0usize..4096) {
            let split = split.min(data.len());
            let mut builder = ObjectIdBuilder::new();
            builder.update(&data[..split]).update(&data[split..]);
            prop_assert_eq!(builder.finalize(), ObjectId::from_bytes(&data));
        }
    }
}

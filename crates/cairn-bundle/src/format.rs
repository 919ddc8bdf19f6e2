//! On-disk layout of a bundle file.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "CRNB"
//! 4       4     format version (u32, big-endian)
//! 8       8     total file size (u64, big-endian)
//! 16      8     manifest length (u64, big-endian)
//! 24      4     CRC32 of the manifest bytes (u32, big-endian)
//! 28      n     bincode manifest (BundleDescription)
//! 28+n    ...   object payloads
//! ```
//!
//! The manifest encoding is fixed-width per entry, so a writer can reserve it
//! up front and rewrite it once the payload offsets are known.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use cairn_types::ObjectId;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::error::{BundleError, BundleResult};

/// File extension of bundle files, without the dot.
pub const BUNDLE_EXTENSION: &str = "bundle";

pub const BUNDLE_MAGIC: [u8; 4] = *b"CRNB";
pub const BUNDLE_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 28;

/// Fixed header at the start of every bundle file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BundleHeader {
    pub total_size: u64,
    pub manifest_len: u64,
    pub manifest_crc: u32,
}

impl BundleHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&BUNDLE_MAGIC);
        buf[4..8].copy_from_slice(&BUNDLE_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.total_size.to_be_bytes());
        buf[16..24].copy_from_slice(&self.manifest_len.to_be_bytes());
        buf[24..28].copy_from_slice(&self.manifest_crc.to_be_bytes());
        buf
    }

    /// Parse a header, checking magic and version only.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, String> {
        if buf[0..4] != BUNDLE_MAGIC {
            return Err(format!(
                "invalid magic: expected {:?}, got {:?}",
                String::from_utf8_lossy(&BUNDLE_MAGIC),
                String::from_utf8_lossy(&buf[0..4])
            ));
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != BUNDLE_VERSION {
            return Err(format!("unsupported version {version}"));
        }
        let mut total = [0u8; 8];
        total.copy_from_slice(&buf[8..16]);
        let mut manifest = [0u8; 8];
        manifest.copy_from_slice(&buf[16..24]);
        Ok(Self {
            total_size: u64::from_be_bytes(total),
            manifest_len: u64::from_be_bytes(manifest),
            manifest_crc: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }

    /// Offset of the first payload byte, `None` when the manifest length
    /// cannot describe a real file.
    pub fn checked_payload_start(&self) -> Option<u64> {
        (HEADER_LEN as u64).checked_add(self.manifest_len)
    }

    /// Offset of the first payload byte. Saturates on a nonsensical manifest
    /// length; [`check_len`](Self::check_len) rejects such headers.
    pub fn payload_start(&self) -> u64 {
        self.checked_payload_start().unwrap_or(u64::MAX)
    }

    /// Check the header against the real file length. A mismatch means the
    /// file was not completely written.
    pub fn check_len(&self, file_len: u64) -> Result<(), String> {
        if self.total_size != file_len {
            return Err(format!(
                "bundle was not completely written: header says {} bytes, file has {file_len}",
                self.total_size
            ));
        }
        match self.checked_payload_start() {
            Some(start) if start <= file_len => {}
            _ => return Err(format!("manifest length {} overruns the file", self.manifest_len)),
        }
        Ok(())
    }
}

/// Where one object lives inside a bundle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Absolute offset of the first stored byte.
    pub start_offset: u64,
    /// Absolute offset one past the last stored byte.
    pub end_offset: u64,
    pub uncompressed_size: u64,
    pub compressed: bool,
    /// 0 for the file holding the manifest, n for its n-th incremental file.
    pub incremental_index: u32,
}

impl ObjectInfo {
    /// Bytes the entry occupies on disk.
    pub fn stored_len(&self) -> u64 {
        self.end_offset.saturating_sub(self.start_offset)
    }
}

/// Decoded bundle manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescription {
    /// Names of bundles that must be loaded first.
    pub dependencies: Vec<String>,
    /// Ids naming the incremental files, in `incremental_index` order.
    pub incremental_bundles: Vec<ObjectId>,
    pub objects: Vec<(ObjectId, ObjectInfo)>,
    /// Asset name → id index published while the bundle is loaded.
    pub assets: Vec<(String, ObjectId)>,
}

impl BundleDescription {
    pub fn encode(&self) -> BundleResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            BundleError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })
    }

    /// Decode and sanity-check a manifest against its header.
    pub fn decode(path: &Path, header: &BundleHeader, bytes: &[u8]) -> BundleResult<Self> {
        if crc32fast::hash(bytes) != header.manifest_crc {
            return Err(BundleError::corrupt(path, "manifest checksum mismatch"));
        }
        let description: Self = bincode::deserialize(bytes)
            .map_err(|e| BundleError::corrupt(path, format!("undecodable manifest: {e}")))?;

        let files = description.incremental_bundles.len() as u32;
        for (id, info) in &description.objects {
            if info.incremental_index > files {
                return Err(BundleError::corrupt(
                    path,
                    format!("object {id} refers to missing incremental file {}", info.incremental_index),
                ));
            }
            if info.start_offset > info.end_offset {
                return Err(BundleError::corrupt(path, format!("object {id} has an inverted range")));
            }
            if info.incremental_index == 0
                && (info.start_offset < header.payload_start() || info.end_offset > header.total_size)
            {
                return Err(BundleError::corrupt(path, format!("object {id} lies outside the payload")));
            }
        }
        Ok(description)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.iter().map(|(id, _)| id)
    }

    /// Sum of the stored lengths of every entry living in this file.
    pub fn payload_len(&self) -> u64 {
        self.objects
            .iter()
            .filter(|(_, info)| info.incremental_index == 0)
            .map(|(_, info)| info.stored_len())
            .sum()
    }
}

fn header_error(path: &Path, e: io::Error) -> BundleError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        BundleError::corrupt(path, "truncated header")
    } else {
        BundleError::Io(e)
    }
}

fn read_header(path: &Path, file: &mut File) -> BundleResult<BundleHeader> {
    let file_len = file.metadata()?.len();
    let mut buf = [0u8; HEADER_LEN];
    file.read_exact(&mut buf).map_err(|e| header_error(path, e))?;
    let header = BundleHeader::parse(&buf).map_err(|reason| BundleError::corrupt(path, reason))?;
    header
        .check_len(file_len)
        .map_err(|reason| BundleError::corrupt(path, reason))?;
    Ok(header)
}

/// Read and validate the manifest of a bundle file.
pub fn read_description(path: &Path) -> BundleResult<BundleDescription> {
    let mut file = File::open(path)?;
    let header = read_header(path, &mut file)?;
    let mut manifest = vec![0u8; header.manifest_len as usize];
    file.read_exact(&mut manifest)?;
    BundleDescription::decode(path, &header, &manifest)
}

/// Check only the header of a bundle file.
pub fn validate_file(path: &Path) -> BundleResult<BundleHeader> {
    let mut file = File::open(path)?;
    read_header(path, &mut file)
}

async fn read_header_async(path: &Path, file: &mut tokio::fs::File) -> BundleResult<BundleHeader> {
    let file_len = file.metadata().await?.len();
    let mut buf = [0u8; HEADER_LEN];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| header_error(path, e))?;
    let header = BundleHeader::parse(&buf).map_err(|reason| BundleError::corrupt(path, reason))?;
    header
        .check_len(file_len)
        .map_err(|reason| BundleError::corrupt(path, reason))?;
    Ok(header)
}

/// Async twin of [`read_description`], used while loading bundles.
pub async fn read_description_async(path: &Path) -> BundleResult<BundleDescription> {
    let mut file = tokio::fs::File::open(path).await?;
    let header = read_header_async(path, &mut file).await?;
    let mut manifest = vec![0u8; header.manifest_len as usize];
    file.read_exact(&mut manifest).await?;
    BundleDescription::decode(path, &header, &manifest)
}

/// Async twin of [`validate_file`].
pub async fn validate_file_async(path: &Path) -> BundleResult<BundleHeader> {
    let mut file = tokio::fs::File::open(path).await?;
    read_header_async(path, &mut file).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_raw(dir: &Path, name: &str, description: &BundleDescription, payload: &[u8]) -> std::path::PathBuf {
        let manifest = description.encode().unwrap();
        let header = BundleHeader {
            total_size: (HEADER_LEN + manifest.len() + payload.len()) as u64,
            manifest_len: manifest.len() as u64,
            manifest_crc: crc32fast::hash(&manifest),
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&manifest);
        bytes.extend_from_slice(payload);
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn sample() -> BundleDescription {
        BundleDescription {
            dependencies: vec!["base".into()],
            incremental_bundles: vec![],
            objects: vec![],
            assets: vec![("a".into(), ObjectId::from_bytes(b"a"))],
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = BundleHeader {
            total_size: 1234,
            manifest_len: 56,
            manifest_crc: 0xDEAD_BEEF,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"CRNB");
        assert_eq!(BundleHeader::parse(&bytes).unwrap(), header);
        assert_eq!(header.payload_start(), 84);
    }

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let mut bytes = BundleHeader::default().to_bytes();
        bytes[0..4].copy_from_slice(b"XKB1");
        assert!(BundleHeader::parse(&bytes).unwrap_err().contains("magic"));

        let mut bytes = BundleHeader::default().to_bytes();
        bytes[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(BundleHeader::parse(&bytes).unwrap_err().contains("99"));
    }

    #[test]
    fn header_length_check() {
        let header = BundleHeader {
            total_size: 100,
            manifest_len: 10,
            manifest_crc: 0,
        };
        assert!(header.check_len(100).is_ok());
        assert!(header.check_len(99).is_err());
        let overrun = BundleHeader {
            total_size: 30,
            manifest_len: 10,
            manifest_crc: 0,
        };
        assert!(overrun.check_len(30).is_err());
    }

    #[test]
    fn huge_manifest_length_is_rejected() {
        let header = BundleHeader {
            total_size: 32,
            manifest_len: u64::MAX - 10,
            manifest_crc: 0,
        };
        assert!(header.checked_payload_start().is_none());
        assert_eq!(header.payload_start(), u64::MAX);
        assert!(header.check_len(32).unwrap_err().contains("overruns"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bundle");
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        std::fs::write(&path, bytes).unwrap();
        let err = read_description(&path).unwrap_err();
        assert!(matches!(err, BundleError::CorruptContainer { .. }));
        assert!(err.to_string().contains("overruns"));
        assert!(matches!(
            validate_file(&path),
            Err(BundleError::CorruptContainer { .. })
        ));
    }

    #[tokio::test]
    async fn huge_manifest_length_is_rejected_async() {
        let header = BundleHeader {
            total_size: 32,
            manifest_len: u64::MAX - 10,
            manifest_crc: 0,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bundle");
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_description_async(&path).await,
            Err(BundleError::CorruptContainer { .. })
        ));
    }

    #[test]
    fn manifest_width_ignores_offset_values() {
        let id = ObjectId::from_bytes(b"x");
        let mut description = sample();
        description.objects.push((id, ObjectInfo::default()));
        let placeholder = description.encode().unwrap();

        description.objects[0].1 = ObjectInfo {
            start_offset: u64::MAX / 3,
            end_offset: u64::MAX / 2,
            uncompressed_size: 1 << 40,
            compressed: true,
            incremental_index: 7,
        };
        assert_eq!(description.encode().unwrap().len(), placeholder.len());
    }

    #[test]
    fn read_valid_description() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(dir.path(), "ok.bundle", &sample(), &[]);
        assert_eq!(read_description(&path).unwrap(), sample());
        assert!(validate_file(&path).is_ok());
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(dir.path(), "t.bundle", &sample(), b"payload");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            read_description(&path),
            Err(BundleError::CorruptContainer { .. })
        ));

        std::fs::write(&path, &bytes[..10]).unwrap();
        let err = read_description(&path).unwrap_err();
        assert!(err.to_string().contains("truncated header"));
    }

    #[test]
    fn flipped_manifest_byte_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(dir.path(), "c.bundle", &sample(), &[]);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_LEN + 2] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        let err = read_description(&path).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn out_of_range_entry_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut description = sample();
        description.objects.push((
            ObjectId::from_bytes(b"far"),
            ObjectInfo {
                start_offset: 10_000,
                end_offset: 10_010,
                uncompressed_size: 10,
                compressed: false,
                incremental_index: 0,
            },
        ));
        let path = write_raw(dir.path(), "r.bundle", &description, &[]);
        assert!(read_description(&path).unwrap_err().to_string().contains("outside"));

        description.objects[0].1.incremental_index = 3;
        let path = write_raw(dir.path(), "i.bundle", &description, &[]);
        assert!(read_description(&path)
            .unwrap_err()
            .to_string()
            .contains("incremental"));
    }

    #[tokio::test]
    async fn async_read_matches_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(dir.path(), "a.bundle", &sample(), b"xyz");
        assert_eq!(
            read_description_async(&path).await.unwrap(),
            read_description(&path).unwrap()
        );
        assert_eq!(validate_file_async(&path).await.unwrap().total_size, std::fs::metadata(&path).unwrap().len());
    }
}

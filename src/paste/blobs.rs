//! Content-addressed blob storage for file payloads
//!
//! Blobs are named by the lowercase hex SHA-256 of their bytes and
//! written via a temp file plus rename, so a crashed write never leaves
//! a partially written blob under its final name.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::paste::StoreError;

/// A chunk manifest for one blob
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlobManifest {
    /// Whole-blob hash (also the blob name)
    pub hash: String,
    /// Total size in bytes
    pub size: u64,
    /// Chunk size the manifest was cut with
    pub chunk_size: usize,
    /// SHA-256 of each chunk, in order
    pub chunk_hashes: Vec<String>,
}

impl BlobManifest {
    /// Number of chunks
    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }
}

/// Filesystem blob store rooted at one directory
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (and create) a blob store at `root`
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Whether a blob with this hash is present
    pub fn has(&self, hash: &str) -> bool {
        self.blob_path(hash).exists()
    }

    /// Store bytes, returning their hash
    pub fn put(&self, data: &[u8]) -> Result<String, StoreError> {
        let hash = hex::encode(Sha256::digest(data));
        self.write_blob(&hash, data)?;
        Ok(hash)
    }

    /// Store bytes that must hash to `expected`
    pub fn put_verified(&self, expected: &str, data: &[u8]) -> Result<(), StoreError> {
        let hash = hex::encode(Sha256::digest(data));
        if hash != expected {
            return Err(StoreError::BlobMismatch {
                expected: expected.to_string(),
            });
        }
        self.write_blob(&hash, data)
    }

    fn write_blob(&self, hash: &str, data: &[u8]) -> Result<(), StoreError> {
        let final_path = self.blob_path(hash);
        if final_path.exists() {
            return Ok(());
        }

        let tmp_path = self.root.join(format!(".{}.{}", hash, Uuid::new_v4()));
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Read a whole blob, verifying its hash
    pub fn read(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let data = std::fs::read(self.blob_path(hash))?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != hash {
            return Err(StoreError::BlobMismatch {
                expected: hash.to_string(),
            });
        }
        Ok(data)
    }

    /// Read one chunk of a blob without loading the rest
    pub fn read_chunk(
        &self,
        hash: &str,
        index: usize,
        chunk_size: usize,
    ) -> Result<Vec<u8>, StoreError> {
        use std::io::{Seek, SeekFrom};

        let mut file = std::fs::File::open(self.blob_path(hash))?;
        file.seek(SeekFrom::Start((index * chunk_size) as u64))?;

        let mut buf = vec![0u8; chunk_size];
        let mut read = 0;
        while read < chunk_size {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    /// Build a chunk manifest for a stored blob
    pub fn manifest(&self, hash: &str, chunk_size: usize) -> Result<BlobManifest, StoreError> {
        let data = self.read(hash)?;
        let chunk_hashes = data
            .chunks(chunk_size.max(1))
            .map(|chunk| hex::encode(Sha256::digest(chunk)))
            .collect();

        Ok(BlobManifest {
            hash: hash.to_string(),
            size: data.len() as u64,
            chunk_size,
            chunk_hashes,
        })
    }

    /// Delete a blob if present
    pub fn remove(&self, hash: &str) -> Result<(), StoreError> {
        let path = self.blob_path(hash);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_read() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let hash = store.put(b"file contents").unwrap();
        assert!(store.has(&hash));
        assert_eq!(store.read(&hash).unwrap(), b"file contents");
    }

    #[test]
    fn test_put_verified_rejects_wrong_hash() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let result = store.put_verified("00".repeat(32).as_str(), b"not that");
        assert!(matches!(result, Err(StoreError::BlobMismatch { .. })));
        assert!(!store.has(&"00".repeat(32)));
    }

    #[test]
    fn test_corrupted_blob_detected_on_read() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let hash = store.put(b"original").unwrap();
        std::fs::write(temp.path().join(&hash), b"tampered").unwrap();

        assert!(matches!(
            store.read(&hash),
            Err(StoreError::BlobMismatch { .. })
        ));
    }

    #[test]
    fn test_chunking_and_manifest() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let hash = store.put(&data).unwrap();

        let manifest = store.manifest(&hash, 1024).unwrap();
        assert_eq!(manifest.size, 2500);
        assert_eq!(manifest.chunk_count(), 3);

        let mut assembled = Vec::new();
        for index in 0..manifest.chunk_count() {
            let chunk = store.read_chunk(&hash, index, 1024).unwrap();
            assert_eq!(
                hex::encode(Sha256::digest(&chunk)),
                manifest.chunk_hashes[index]
            );
            assembled.extend_from_slice(&chunk);
        }
        assert_eq!(assembled, data);
    }

    #[test]
    fn test_last_chunk_is_short() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let hash = store.put(&[1u8; 1500]).unwrap();
        let chunk = store.read_chunk(&hash, 1, 1024).unwrap();
        assert_eq!(chunk.len(), 476);
    }
}

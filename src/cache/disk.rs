//! Optional on-disk cache tier.
//!
//! One JSON record per (proof, config) key, named by the key hash. Each
//! record carries a SHA-256 of its entry payload; a record that fails the
//! checksum, fails to parse, or fails entry validation is discarded rather
//! than trusted. Writes go through a temp file and rename so readers never
//! observe a half-written record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::entry::{CacheEntry, CacheKey};
use crate::canonical::canonical_hash_hex;

/// Disk tier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    /// Directory the records live in. Created on first write.
    pub dir: PathBuf,
}

/// A record as stored on disk.
#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    /// Hex SHA-256 of the serialized entry.
    checksum: String,
    entry: CacheEntry,
}

/// Why a disk operation produced nothing usable.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DiskFailure {
    /// IO or serialization error; the tier itself misbehaved.
    Io(String),
    /// The record exists but cannot be trusted.
    Corrupt(String),
}

pub(crate) struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub(crate) fn new(config: DiskCacheConfig) -> Self {
        Self { dir: config.dir }
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", canonical_hash_hex(key)))
    }

    /// Read and verify the record for a key. `Ok(None)` means no record.
    pub(crate) fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, DiskFailure> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DiskFailure::Io(format!("read {}: {e}", path.display()))),
        };

        let record: DiskRecord = serde_json::from_slice(&bytes)
            .map_err(|e| DiskFailure::Corrupt(format!("parse {}: {e}", path.display())))?;

        let payload = serde_json::to_vec(&record.entry)
            .map_err(|e| DiskFailure::Io(format!("reserialize entry: {e}")))?;
        if checksum_hex(&payload) != record.checksum {
            return Err(DiskFailure::Corrupt(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        Ok(Some(record.entry))
    }

    /// Persist a record, replacing any previous one for the key.
    pub(crate) fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), DiskFailure> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| DiskFailure::Io(format!("create {}: {e}", self.dir.display())))?;

        let payload = serde_json::to_vec(entry)
            .map_err(|e| DiskFailure::Io(format!("serialize entry: {e}")))?;
        let record = DiskRecord {
            checksum: checksum_hex(&payload),
            entry: entry.clone(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| DiskFailure::Io(format!("serialize record: {e}")))?;

        let path = self.record_path(key);
        let tmp = path.with_extension("json.tmp");
        write_atomic(&tmp, &path, &bytes)
            .map_err(|e| DiskFailure::Io(format!("write {}: {e}", path.display())))
    }

    /// Drop the record for a key, ignoring absence.
    pub(crate) fn remove(&self, key: &CacheKey) {
        let path = self.record_path(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove cache record");
            }
        }
    }
}

fn write_atomic(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, path)
}

fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ExplanationConfig;
    use crate::provider::StubProvider;
    use crate::types::{Leaf, LeafSet, SourceSpan};
    use crate::TreeBuilder;
    use std::sync::Arc;

    async fn sample_entry(key: &CacheKey) -> CacheEntry {
        let leaves = vec![
            Leaf::new(
                "l1",
                "Decl.l1",
                "a",
                Some(1),
                vec![],
                SourceSpan::new("Main.lean", 1, 1),
            ),
            Leaf::new(
                "l2",
                "Decl.l2",
                "b",
                Some(1),
                vec![],
                SourceSpan::new("Main.lean", 2, 2),
            ),
        ];
        let tree = TreeBuilder::new(Arc::new(StubProvider::new()), ExplanationConfig::default())
            .build(&LeafSet::new(leaves.clone()).unwrap())
            .await
            .unwrap();
        CacheEntry::new(key, leaves, tree, 0, "build-1".to_string())
    }

    fn key() -> CacheKey {
        CacheKey {
            proof_id: "nat.add".to_string(),
            config_hash: ExplanationConfig::default().config_hash(),
        }
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(DiskCacheConfig {
            dir: dir.path().to_path_buf(),
        });
        let key = key();
        let entry = sample_entry(&key).await;

        disk.write(&key, &entry).unwrap();
        let loaded = disk.read(&key).unwrap().unwrap();
        assert_eq!(loaded, entry);
    }

    #[tokio::test]
    async fn test_missing_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(DiskCacheConfig {
            dir: dir.path().to_path_buf(),
        });
        assert_eq!(disk.read(&key()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_tampered_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(DiskCacheConfig {
            dir: dir.path().to_path_buf(),
        });
        let key = key();
        let entry = sample_entry(&key).await;
        disk.write(&key, &entry).unwrap();

        let path = disk.record_path(&key);
        let mangled = fs::read_to_string(&path)
            .unwrap()
            .replace("build-1", "build-X");
        fs::write(&path, mangled).unwrap();

        assert!(matches!(disk.read(&key), Err(DiskFailure::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(DiskCacheConfig {
            dir: dir.path().to_path_buf(),
        });
        let key = key();
        let entry = sample_entry(&key).await;
        disk.write(&key, &entry).unwrap();

        disk.remove(&key);
        disk.remove(&key);
        assert_eq!(disk.read(&key).unwrap(), None);
    }
}

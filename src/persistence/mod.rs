//! Persistence Module
//!
//! Stores partition metadata (never values) so persisted partitions come
//! back after a restart.

use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheKey, PartitionMetadata};
use crate::error::{CacheError, Result};

/// Characters that cannot appear in a partition name because the name
/// becomes a file name.
const UNSAFE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

const METADATA_EXTENSION: &str = "json";

// == Metadata Store Trait ==
pub trait MetadataStore: Send + Sync + Debug {
    /// Writes (or overwrites) the metadata of one partition.
    fn persist(&self, partition: &CacheKey, metadata: &PartitionMetadata) -> Result<()>;

    /// Removes a partition's metadata. Missing metadata is not an error.
    fn delete(&self, partition: &CacheKey) -> Result<()>;

    /// Loads every persisted partition.
    fn recover(&self) -> Result<Vec<(CacheKey, PartitionMetadata)>>;
}

/// Checks that a partition name is present and safe to use as a file name.
pub fn validate_partition_key(partition: &CacheKey) -> Result<()> {
    if partition.is_empty() {
        return Err(CacheError::MissingPartitionKey);
    }
    let name = partition
        .as_str()
        .ok_or_else(|| CacheError::InvalidPartitionKey(partition.to_string()))?;
    let unsafe_name = name == "."
        || name == ".."
        || name
            .chars()
            .any(|c| c.is_control() || UNSAFE_CHARS.contains(&c));
    if unsafe_name {
        return Err(CacheError::InvalidPartitionKey(name.to_string()));
    }
    Ok(())
}

// == Null Store ==
/// Discards everything; used when no metadata directory is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetadataStore;

impl MetadataStore for NullMetadataStore {
    fn persist(&self, _partition: &CacheKey, _metadata: &PartitionMetadata) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _partition: &CacheKey) -> Result<()> {
        Ok(())
    }

    fn recover(&self) -> Result<Vec<(CacheKey, PartitionMetadata)>> {
        Ok(Vec::new())
    }
}

// == File Store ==
#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    partition: String,
    metadata: PartitionMetadata,
}

/// One JSON file per persisted partition under a directory.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    /// Opens the directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, partition: &CacheKey) -> Result<PathBuf> {
        validate_partition_key(partition)?;
        Ok(self
            .dir
            .join(format!("{}.{}", partition, METADATA_EXTENSION)))
    }

    fn read_record(path: &Path) -> Result<MetadataRecord> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl MetadataStore for FileMetadataStore {
    fn persist(&self, partition: &CacheKey, metadata: &PartitionMetadata) -> Result<()> {
        let path = self.path_for(partition)?;
        let record = MetadataRecord {
            partition: partition.to_string(),
            metadata: metadata.clone(),
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, &path)?;
        debug!(partition = %partition, path = %path.display(), "Persisted partition metadata");
        Ok(())
    }

    fn delete(&self, partition: &CacheKey) -> Result<()> {
        let path = self.path_for(partition)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn recover(&self) -> Result<Vec<(CacheKey, PartitionMetadata)>> {
        let mut recovered = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXTENSION) {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => {
                    recovered.push((CacheKey::from(record.partition), record.metadata));
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable partition metadata");
                }
            }
        }
        recovered.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(recovered)
    }
}

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::CacheStorage;
use crate::artifact::Artifact;
use crate::error::{BerthError, Result};
use crate::fingerprint::Fingerprint;

/// On-disk cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    fingerprint: Fingerprint,
    artifact: Artifact,
    recorded_at: DateTime<Utc>,
}

/// Filesystem-backed cache storage with git-style 2-char sharding.
///
/// Layout: `<root>/records/<first 2 hex chars>/<remaining hex chars>.json`
#[derive(Debug, Clone)]
pub struct FsCacheStorage {
    records_dir: PathBuf,
}

impl FsCacheStorage {
    /// Create storage rooted at `root`. Creates `root/records/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let records_dir = root.as_ref().join("records");
        fs::create_dir_all(&records_dir)?;
        Ok(Self { records_dir })
    }

    fn record_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.as_str();
        self.records_dir
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }
}

fn write_record(path: &Path, record: &CacheRecord) -> Result<()> {
    let shard_dir = path
        .parent()
        .ok_or_else(|| BerthError::Storage(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(shard_dir)?;

    // Write to a temp file in the same directory, then rename.
    let mut tmp = NamedTempFile::new_in(shard_dir)?;
    tmp.write_all(&serde_json::to_vec_pretty(record)?)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CacheStorage for FsCacheStorage {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        let path = self.record_path(fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BerthError::Io(e)),
        };
        let record: CacheRecord = serde_json::from_slice(&bytes)
            .map_err(|e| BerthError::Storage(format!("corrupt record {}: {e}", path.display())))?;
        if &record.fingerprint != fingerprint {
            return Err(BerthError::Storage(format!(
                "record {} holds fingerprint {}",
                path.display(),
                record.fingerprint
            )));
        }
        Ok(Some(record.artifact))
    }

    async fn put(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<()> {
        let path = self.record_path(fingerprint);
        let record = CacheRecord {
            fingerprint: fingerprint.clone(),
            artifact: artifact.clone(),
            recorded_at: Utc::now(),
        };
        tokio::task::spawn_blocking(move || write_record(&path, &record))
            .await
            .map_err(|e| BerthError::Storage(format!("cache writer panicked: {e}")))?
    }
}

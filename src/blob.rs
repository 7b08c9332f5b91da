//! Serialization, compression and durable persistence of the run artifact.
//!
//! The aggregated membership is serialized to canonical JSON, gzip
//! compressed, digested, and written through the [`BlobStore`] port under a
//! path keyed by destination + run start time + run id + part number, which
//! is unique across runs and parts. Write failures are never retried here;
//! they surface to the status controller as fatal.

use std::io::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use groupsync_common::{AggregatedMembership, BlobStore, GroupId, SyncError};

/// Gzip + JSON codec for the run artifact.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCompressor {
    level: Compression,
}

impl Default for PayloadCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl PayloadCompressor {
    /// `level` 0-9 as flate2 defines it.
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }

    pub fn compress(&self, artifact: &AggregatedMembership) -> Result<Vec<u8>, SyncError> {
        let json = serde_json::to_vec(artifact)
            .map_err(|e| anyhow::anyhow!("artifact serialization failed: {}", e))?;
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| anyhow::anyhow!("artifact compression failed: {}", e).into())
    }

    pub fn decompress(bytes: &[u8]) -> Result<AggregatedMembership, SyncError> {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut json = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut json)
            .map_err(|e| anyhow::anyhow!("artifact decompression failed: {}", e))?;
        serde_json::from_slice(&json)
            .map_err(|e| anyhow::anyhow!("artifact deserialization failed: {}", e).into())
    }
}

/// Storage path for one run's artifact. The (run id, part) pair makes the
/// path collision-free across runs and parts of one destination.
pub fn artifact_path(
    destination: GroupId,
    started_at: DateTime<Utc>,
    run_id: Uuid,
    part_number: u32,
) -> String {
    format!(
        "{}/{}/{}_part{}.json.gz",
        destination,
        started_at.format("%Y%m%d-%H%M%S"),
        run_id,
        part_number
    )
}

/// Handle to a persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArtifactHandle {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// Writes compressed artifacts through a [`BlobStore`].
pub struct BlobWriter<'a> {
    store: &'a dyn BlobStore,
    compressor: PayloadCompressor,
}

impl<'a> BlobWriter<'a> {
    pub fn new(store: &'a dyn BlobStore, compressor: PayloadCompressor) -> Self {
        Self { store, compressor }
    }

    pub async fn persist(
        &self,
        artifact: &AggregatedMembership,
        started_at: DateTime<Utc>,
        part_number: u32,
    ) -> Result<ArtifactHandle, SyncError> {
        let bytes = self.compressor.compress(artifact)?;
        let path = artifact_path(artifact.destination, started_at, artifact.run_id, part_number);
        let sha256 = hex::encode(Sha256::digest(&bytes));

        self.store.write(&path, &bytes).await?;

        info!(
            path,
            size = bytes.len(),
            members = artifact.members.len(),
            "artifact persisted"
        );
        Ok(ArtifactHandle {
            path,
            size: bytes.len() as u64,
            sha256,
        })
    }
}

/// Filesystem-backed blob store. Writes land in a temp file and are renamed
/// into place, so a partial write never becomes visible under the final path.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SyncError> {
        let target = self.full_path(path);
        let blob_err = |e: std::io::Error| SyncError::BlobWrite {
            path: path.to_string(),
            source: e,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(blob_err)?;
        }
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(blob_err)?;
        tokio::fs::rename(&tmp, &target).await.map_err(blob_err)?;
        Ok(())
    }
}

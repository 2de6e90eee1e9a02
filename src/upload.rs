//! Object-store uploader.
//!
//! Sweeps the archive tree for sealed segments the watermark has not seen,
//! uploads them (multipart above a threshold), verifies the remote object,
//! records completion in a local watermark file, and deletes local copies
//! only after confirmed receipt plus a retention delay. The manifest is
//! re-uploaded whenever its hash changes, replacing the remote object.
//!
//! Everything here is idempotent under retry: the same segment uploaded
//! twice lands at the same key with the same content, and the watermark is
//! only advanced after the remote object checks out.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::archive::layout::{MANIFEST_FILE, SEGMENT_SUFFIX};

const MULTIPART_CHUNK: usize = 8 * 1024 * 1024;
const WATERMARK_FILE: &str = ".upload-watermark.json";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store: {0}")]
    Store(#[from] object_store::Error),
    #[error("watermark does not parse: {0}")]
    Watermark(String),
    #[error("verification failed for {key}: local {local} bytes, remote {remote} bytes")]
    Verify { key: String, local: u64, remote: u64 },
}

type Result<T> = std::result::Result<T, UploadError>;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Local archive root (the segment writer's output).
    pub root: PathBuf,
    pub feed: String,
    /// Key prefix inside the bucket.
    pub prefix: String,
    pub multipart_threshold_bytes: u64,
    /// Delay between confirmed upload and local delete.
    pub local_retention: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadedEntry {
    sha256: String,
    size: u64,
    uploaded_at_ns: u64,
    #[serde(default)]
    deleted_locally: bool,
}

/// Locally persisted record of confirmed uploads, keyed by the
/// `{date}/{name}` relative path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Watermark {
    uploaded: BTreeMap<String, UploadedEntry>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub segments_uploaded: usize,
    pub manifests_uploaded: usize,
    pub locals_deleted: usize,
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    config: UploaderConfig,
    watermark: Watermark,
    watermark_path: PathBuf,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploaderConfig) -> Result<Self> {
        let watermark_path = config.root.join(&config.feed).join(WATERMARK_FILE);
        let watermark = match std::fs::read(&watermark_path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| UploadError::Watermark(e.to_string()))?,
            Err(_) => Watermark::default(),
        };
        Ok(Self {
            store,
            config,
            watermark,
            watermark_path,
        })
    }

    fn key_for(&self, rel: &str) -> ObjectPath {
        if self.config.prefix.is_empty() {
            ObjectPath::from(format!("{}/{rel}", self.config.feed))
        } else {
            ObjectPath::from(format!("{}/{}/{rel}", self.config.prefix, self.config.feed))
        }
    }

    /// One pass over the archive tree. Uploads new sealed segments and
    /// changed manifests, then applies the retention delete.
    pub async fn sweep(&mut self, now_ns: u64) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let feed_dir = self.config.root.join(&self.config.feed);
        if !feed_dir.exists() {
            return Ok(stats);
        }

        let mut dates: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&feed_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                dates.push(path);
            }
        }
        dates.sort();

        for date_dir in dates {
            let date = date_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut segments: Vec<String> = Vec::new();
            for entry in std::fs::read_dir(&date_dir)? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                // Only sealed segments: the writer's `.partial` -> final
                // rename is the signal a file is safe to ship.
                if name.ends_with(SEGMENT_SUFFIX) {
                    segments.push(name);
                }
            }
            segments.sort();

            for name in segments {
                let rel = format!("{date}/{name}");
                let path = date_dir.join(&name);
                if self.upload_segment(&rel, &path, now_ns).await? {
                    stats.segments_uploaded += 1;
                }
            }

            let manifest_path = date_dir.join(MANIFEST_FILE);
            if manifest_path.exists()
                && self
                    .upload_manifest(&format!("{date}/{MANIFEST_FILE}"), &manifest_path, now_ns)
                    .await?
            {
                stats.manifests_uploaded += 1;
            }
        }

        stats.locals_deleted = self.apply_retention(now_ns)?;
        Ok(stats)
    }

    /// Uploads one sealed segment unless the watermark already confirms it.
    /// Returns true when an upload happened.
    async fn upload_segment(&mut self, rel: &str, path: &Path, now_ns: u64) -> Result<bool> {
        let size = path.metadata()?.len();
        if let Some(entry) = self.watermark.uploaded.get(rel) {
            if entry.size == size {
                return Ok(false);
            }
            // A size change on a sealed segment should not happen; re-ship
            // the current bytes rather than trusting the stale record.
            warn!("sealed segment {rel} changed size, re-uploading");
        }

        let key = self.key_for(rel);
        let sha256 = self.put_file(&key, path, size).await?;
        self.verify(&key, size).await?;

        self.watermark.uploaded.insert(
            rel.to_owned(),
            UploadedEntry {
                sha256,
                size,
                uploaded_at_ns: now_ns,
                deleted_locally: false,
            },
        );
        self.save_watermark()?;
        info!("uploaded {rel} ({size} bytes)");
        Ok(true)
    }

    /// Uploads the manifest when its content hash moved. The manifest is
    /// small and replaced whole, so this stays cheap.
    async fn upload_manifest(&mut self, rel: &str, path: &Path, now_ns: u64) -> Result<bool> {
        let bytes = std::fs::read(path)?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        if let Some(entry) = self.watermark.uploaded.get(rel) {
            if entry.sha256 == sha256 {
                return Ok(false);
            }
        }

        let key = self.key_for(rel);
        let size = bytes.len() as u64;
        self.store.put(&key, PutPayload::from(bytes)).await?;

        self.watermark.uploaded.insert(
            rel.to_owned(),
            UploadedEntry {
                sha256,
                size,
                uploaded_at_ns: now_ns,
                deleted_locally: false,
            },
        );
        self.save_watermark()?;
        debug!("manifest {rel} replaced remotely");
        Ok(true)
    }

    /// Streams a file to the store, multipart above the threshold. Returns
    /// the content hash computed while reading.
    async fn put_file(&self, key: &ObjectPath, path: &Path, size: u64) -> Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();

        if size > self.config.multipart_threshold_bytes {
            let upload = self.store.put_multipart(key).await?;
            let mut write = WriteMultipart::new(upload);
            let mut chunk = vec![0u8; MULTIPART_CHUNK];
            loop {
                let read = file.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                hasher.update(&chunk[..read]);
                write.write(&chunk[..read]);
            }
            write.finish().await?;
        } else {
            let mut bytes = Vec::with_capacity(size as usize);
            file.read_to_end(&mut bytes)?;
            hasher.update(&bytes);
            self.store.put(key, PutPayload::from(bytes)).await?;
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Confirms the remote object before the watermark advances. Deletion
    /// of the local copy is never allowed past this check.
    async fn verify(&self, key: &ObjectPath, local_size: u64) -> Result<()> {
        let meta = self.store.head(key).await?;
        if meta.size as u64 != local_size {
            return Err(UploadError::Verify {
                key: key.to_string(),
                local: local_size,
                remote: meta.size as u64,
            });
        }
        Ok(())
    }

    /// Deletes local segments whose upload was confirmed longer than the
    /// retention delay ago.
    fn apply_retention(&mut self, now_ns: u64) -> Result<usize> {
        let retention_ns = self.config.local_retention.as_nanos() as u64;
        let feed_dir = self.config.root.join(&self.config.feed);
        let mut deleted = 0;
        let mut dirty = false;

        for (rel, entry) in self.watermark.uploaded.iter_mut() {
            if entry.deleted_locally || !rel.ends_with(SEGMENT_SUFFIX) {
                continue;
            }
            if now_ns.saturating_sub(entry.uploaded_at_ns) < retention_ns {
                continue;
            }
            let path = feed_dir.join(rel);
            if path.exists() {
                std::fs::remove_file(&path)?;
                deleted += 1;
                debug!("retention delete {rel}");
            }
            entry.deleted_locally = true;
            dirty = true;
        }
        if dirty {
            self.save_watermark()?;
        }
        Ok(deleted)
    }

    fn save_watermark(&self) -> Result<()> {
        let tmp = self.watermark_path.with_extension("json.tmp");
        if let Some(parent) = tmp.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&self.watermark)
            .map_err(|e| UploadError::Watermark(e.to_string()))?;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.watermark_path)?;
        Ok(())
    }
}

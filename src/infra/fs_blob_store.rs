use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::app::ports::BlobStorePort;
use crate::error::{MigrationError, Result};

/// Buckets as directories under `root`; object names map to relative paths.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf> {
        if name.split('/').any(|seg| seg == "..") {
            return Err(MigrationError::BlobStore(format!("refusing object name {:?}", name)));
        }
        Ok(self.bucket_dir(bucket).join(name))
    }

    /// Directory holding everything that can start with `prefix`.
    fn listing_dir(&self, bucket: &str, prefix: &str) -> PathBuf {
        match prefix.rfind('/') {
            Some(idx) => self.bucket_dir(bucket).join(&prefix[..idx]),
            None => self.bucket_dir(bucket),
        }
    }

    fn relative_name(&self, bucket: &str, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.bucket_dir(bucket)).ok()?;
        let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobStorePort for FsBlobStore {
    async fn list_prefixes(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.listing_dir(bucket, prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| MigrationError::BlobStore(e.to_string()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(name) = self.relative_name(bucket, entry.path()) {
                let child = format!("{}/", name);
                if child.starts_with(prefix) {
                    out.push(child);
                }
            }
        }
        Ok(out)
    }

    async fn list_blobs(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.listing_dir(bucket, prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| MigrationError::BlobStore(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = self.relative_name(bucket, entry.path()) {
                if name.starts_with(prefix) {
                    out.push(name);
                }
            }
        }
        Ok(out)
    }

    async fn blob_exists(&self, bucket: &str, name: &str) -> Result<bool> {
        Ok(self.object_path(bucket, name)?.is_file())
    }

    async fn read_blob(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MigrationError::BlobNotFound { bucket: bucket.into(), name: name.into() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_blob(&self, bucket: &str, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let path = self.object_path(bucket, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!("Wrote {} ({})", path.display(), content_type);
        Ok(())
    }

    async fn uniform_access(&self, _bucket: &str) -> Result<bool> {
        Ok(true)
    }

    async fn make_public(&self, _bucket: &str, _name: &str) -> Result<()> {
        Ok(())
    }
}

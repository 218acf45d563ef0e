//! Base image object store.
//!
//! Images are fetched in ranged chunks into `<name>.partial` inside the cache
//! directory, hashed on the way, and renamed into place once complete.

use crate::cache::{FetchedImage, PARTIAL_SUFFIX};
use crate::config::ObjectStoreConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use opendal::{services, Operator};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Size of each ranged read.
const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Source of base images.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download object `name` into `dest_dir/<name>`.
    async fn download(&self, name: &str, dest_dir: &Path) -> Result<FetchedImage>;
}

/// Reject object names that could escape the cache directory.
pub fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("image name cannot be empty".into()));
    }
    if name.len() > 255 {
        return Err(Error::Validation("image name too long".into()));
    }
    if name.starts_with('.') {
        return Err(Error::Validation(format!(
            "image name '{}' cannot start with '.'",
            name
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(Error::Validation(format!(
            "image name '{}' cannot contain path separators",
            name
        )));
    }
    if name.ends_with(PARTIAL_SUFFIX) {
        return Err(Error::Validation(format!(
            "image name '{}' uses a reserved suffix",
            name
        )));
    }
    Ok(())
}

/// Object store backed by an opendal operator.
#[derive(Debug, Clone)]
pub struct OpendalStore {
    op: Operator,
}

impl OpendalStore {
    /// Build a store for the configured service.
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        let op = match config {
            ObjectStoreConfig::Gcs {
                bucket,
                credential_path,
            } => {
                let mut builder = services::Gcs::default().bucket(bucket);
                if let Some(path) = credential_path {
                    builder = builder.credential_path(&path.to_string_lossy());
                }
                Operator::new(builder).map_err(store_err)?.finish()
            }
            ObjectStoreConfig::Fs { root } => {
                let builder = services::Fs::default().root(&root.to_string_lossy());
                Operator::new(builder).map_err(store_err)?.finish()
            }
        };
        Ok(Self { op })
    }

    /// Wrap an existing operator.
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    async fn fetch_into(&self, name: &str, partial: &Path) -> Result<(u64, String)> {
        let meta = self.op.stat(name).await.map_err(|e| {
            if e.kind() == opendal::ErrorKind::NotFound {
                Error::ObjectStore(format!("image '{}' not found", name))
            } else {
                store_err(e)
            }
        })?;
        let total = meta.content_length();
        let reader = self.op.reader(name).await.map_err(store_err)?;

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| Error::storage("create partial file", format!("{}: {}", partial.display(), e)))?;
        let mut hasher = Sha256::new();
        let mut offset = 0u64;

        while offset < total {
            let end = (offset + CHUNK_SIZE).min(total);
            let chunk = reader.read(offset..end).await.map_err(store_err)?.to_bytes();
            if chunk.is_empty() {
                return Err(Error::ObjectStore(format!(
                    "image '{}' truncated at {} of {} bytes",
                    name, offset, total
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::storage("write partial file", e.to_string()))?;
            offset += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| Error::storage("flush partial file", e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| Error::storage("sync partial file", e.to_string()))?;

        Ok((offset, hex::encode(hasher.finalize())))
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn download(&self, name: &str, dest_dir: &Path) -> Result<FetchedImage> {
        validate_object_name(name)?;
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| Error::storage("create cache dir", format!("{}: {}", dest_dir.display(), e)))?;

        let path = dest_dir.join(name);
        let partial = PartialFile(dest_dir.join(format!("{}{}", name, PARTIAL_SUFFIX)));

        tracing::info!(image = %name, dest = %path.display(), "fetching image from object store");
        let started = std::time::Instant::now();
        let (size_bytes, checksum) = self.fetch_into(name, &partial.0).await?;

        tokio::fs::rename(&partial.0, &path)
            .await
            .map_err(|e| Error::storage("rename partial file", format!("{}: {}", path.display(), e)))?;

        tracing::info!(
            image = %name,
            size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "image fetched"
        );
        Ok(FetchedImage {
            path,
            size_bytes,
            checksum: Some(checksum),
        })
    }
}

/// Removes the partial file when dropped, unless it was renamed away.
struct PartialFile(PathBuf);

impl Drop for PartialFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => tracing::debug!(path = %self.0.display(), "removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.0.display(), error = %e, "failed to remove partial download"),
        }
    }
}

fn store_err(e: opendal::Error) -> Error {
    Error::ObjectStore(e.to_string())
}

/// Build the configured object store.
pub fn create_store(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    Ok(Arc::new(OpendalStore::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_store(root: &Path) -> OpendalStore {
        OpendalStore::from_config(&ObjectStoreConfig::Fs {
            root: root.to_path_buf(),
        })
        .unwrap()
    }

    #[test]
    fn test_validate_object_name() {
        assert!(validate_object_name("macos-sonoma-14.5.img").is_ok());
        assert!(validate_object_name("").is_err());
        assert!(validate_object_name("../etc/passwd").is_err());
        assert!(validate_object_name("a/b").is_err());
        assert!(validate_object_name(".hidden").is_err());
        assert!(validate_object_name("x.partial").is_err());
    }

    #[tokio::test]
    async fn test_download_from_fs_store() {
        let bucket = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(bucket.path().join("sonoma"), b"abc").unwrap();

        let image = fs_store(bucket.path())
            .download("sonoma", cache.path())
            .await
            .unwrap();

        assert_eq!(image.path, cache.path().join("sonoma"));
        assert_eq!(image.size_bytes, 3);
        assert_eq!(
            image.checksum.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(std::fs::read(&image.path).unwrap(), b"abc");
        assert!(!cache.path().join("sonoma.partial").exists());
    }

    #[tokio::test]
    async fn test_missing_object_leaves_nothing_behind() {
        let bucket = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();

        let err = fs_store(bucket.path())
            .download("absent", cache.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectStore(_)), "{err}");
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    }
}

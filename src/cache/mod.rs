//! Local cache of base images.
//!
//! The cache maps image names to files in the cache directory and keeps at
//! most `capacity` ready images, evicting the least recently used first.
//! While an image downloads it is represented by a placeholder entry; other
//! requests for it join the in-flight download instead of starting their own.
//!
//! The metadata lock is only held for map updates and for unlinking evicted
//! files. Downloads and checksum scans run outside it.

pub mod download;

pub use download::{DownloadFailure, DownloadOutcome, FetchedImage};

use crate::error::{Error, Result};
use download::{DownloadCoordinator, DownloadHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

/// Suffix of files still being written by a download.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A cache entry.
#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size_bytes: u64,
    checksum: Option<String>,
    last_used_at: SystemTime,
    /// Logical recency; larger is more recent.
    touch_seq: u64,
    downloading: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Refresh recency of a ready entry and return its path.
    fn touch(&mut self, name: &str) -> Option<PathBuf> {
        let seq = self.tick();
        let entry = self.entries.get_mut(name).filter(|e| !e.downloading)?;
        entry.touch_seq = seq;
        entry.last_used_at = SystemTime::now();
        Some(entry.path.clone())
    }

    fn ready_count(&self) -> usize {
        self.entries.values().filter(|e| !e.downloading).count()
    }

    /// Evict least recently used ready entries until at or under `capacity`.
    ///
    /// Entries whose file cannot be removed stay in the map and are skipped.
    /// Returns the names evicted.
    fn evict_over(&mut self, capacity: usize) -> Vec<String> {
        let mut excess = self.ready_count().saturating_sub(capacity);
        if excess == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.downloading)
            .map(|(name, e)| (e.touch_seq, name.clone()))
            .collect();
        candidates.sort();

        let mut evicted = Vec::new();
        for (_, name) in candidates {
            if excess == 0 {
                break;
            }
            let Some(entry) = self.entries.get(&name) else {
                continue;
            };
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(image = %name, path = %entry.path.display(), error = %e, "failed to evict cached image, skipping");
                    continue;
                }
            }
            tracing::info!(image = %name, "evicted cached image");
            self.entries.remove(&name);
            evicted.push(name);
            excess -= 1;
        }

        if excess > 0 {
            tracing::warn!(excess, "image cache over capacity, eviction deferred");
        }
        evicted
    }
}

/// Snapshot of a cache entry for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageInfo {
    /// Image name.
    pub name: String,
    /// Local file.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Hex SHA-256, when known.
    pub checksum: Option<String>,
    /// Last use, seconds since Unix epoch.
    pub last_used_at: u64,
    /// Whether the image is still downloading.
    pub downloading: bool,
}

/// Capacity-bounded LRU cache of base images.
#[derive(Debug, Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    capacity: usize,
    download_timeout: Duration,
    state: Mutex<CacheState>,
    downloads: DownloadCoordinator,
}

impl ImageCache {
    /// Create an empty cache over `dir`.
    ///
    /// Downloads are abandoned when `shutdown` is cancelled.
    pub fn new(
        dir: impl Into<PathBuf>,
        capacity: usize,
        download_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.into(),
                capacity,
                download_timeout,
                state: Mutex::new(CacheState::default()),
                downloads: DownloadCoordinator::new(shutdown),
            }),
        }
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Path of a ready image, refreshing its recency.
    ///
    /// An image that is still downloading is reported as a miss.
    pub fn get(&self, name: &str) -> Option<PathBuf> {
        self.inner.state.lock().touch(name)
    }

    /// Whether a ready entry exists, without touching it.
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .get(name)
            .is_some_and(|e| !e.downloading)
    }

    /// Number of ready entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().ready_count()
    }

    /// Whether there are no ready entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, most recently used first.
    pub fn entries(&self) -> Vec<CachedImageInfo> {
        let state = self.inner.state.lock();
        let mut entries: Vec<(u64, CachedImageInfo)> = state
            .entries
            .iter()
            .map(|(name, e)| {
                (
                    e.touch_seq,
                    CachedImageInfo {
                        name: name.clone(),
                        path: e.path.clone(),
                        size_bytes: e.size_bytes,
                        checksum: e.checksum.clone(),
                        last_used_at: crate::util::unix_seconds(e.last_used_at),
                        downloading: e.downloading,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, info)| info).collect()
    }

    /// Return the local path of `name`, downloading it with `fetch` if needed.
    ///
    /// Concurrent calls for the same name share one download. A failed
    /// download leaves no entry behind, so the next call starts over. The
    /// wait is bounded by the configured download timeout; giving up does not
    /// abort the download for other callers.
    pub async fn ensure_available<F, Fut>(&self, name: &str, fetch: F) -> Result<PathBuf>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<FetchedImage>> + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + self.inner.download_timeout;

        loop {
            let (ticket, start) = {
                let mut state = self.inner.state.lock();
                match state.entries.get(name).map(|e| e.downloading) {
                    Some(false) => {
                        if let Some(path) = state.touch(name) {
                            tracing::debug!(image = %name, "image cache hit");
                            return Ok(path);
                        }
                        continue;
                    }
                    Some(true) => match self.inner.downloads.join(name) {
                        Some(ticket) => {
                            tracing::debug!(image = %name, "joining in-flight download");
                            (ticket, None)
                        }
                        None => {
                            return Err(Error::ImageUnavailable {
                                image: name.to_string(),
                                reason: "placeholder without a download in flight".into(),
                            })
                        }
                    },
                    None => {
                        let seq = state.tick();
                        state.entries.insert(
                            name.to_string(),
                            CacheEntry {
                                path: self.inner.dir.join(name),
                                size_bytes: 0,
                                checksum: None,
                                last_used_at: SystemTime::now(),
                                touch_seq: seq,
                                downloading: true,
                            },
                        );
                        self.inner.downloads.request_or_join(name)
                    }
                }
            };

            if let Some(handle) = start {
                tracing::info!(image = %name, "downloading image");
                self.spawn_fetch(handle, fetch());
            }

            match ticket.wait_until(deadline).await {
                Some(Ok(image)) => return Ok(image.path),
                Some(Err(DownloadFailure::Failed(reason))) => {
                    return Err(Error::ImageUnavailable {
                        image: name.to_string(),
                        reason,
                    })
                }
                Some(Err(DownloadFailure::Cancelled)) => {
                    if self.inner.downloads.is_shutting_down() {
                        return Err(Error::Cancelled(format!("download of image '{}'", name)));
                    }
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    // Every other waiter gave up on that download; start again.
                    tracing::debug!(image = %name, "shared download cancelled, retrying");
                }
                None => break,
            }
        }

        Err(Error::ImageUnavailable {
            image: name.to_string(),
            reason: Error::timeout("download", self.inner.download_timeout).to_string(),
        })
    }

    fn spawn_fetch<Fut>(&self, handle: DownloadHandle, fetch: Fut)
    where
        Fut: Future<Output = Result<FetchedImage>> + Send + 'static,
    {
        let cancel = handle.cancellation();
        let mut guard = FinishGuard {
            cache: self.clone(),
            handle: Some(handle),
            outcome: None,
        };

        tokio::spawn(async move {
            // Run the fetch as its own task so a panic surfaces as a JoinError.
            let fetch = AbortOnDropHandle::new(tokio::spawn(fetch));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(DownloadFailure::Cancelled),
                joined = fetch => match joined {
                    Ok(result) => result.map_err(|e| DownloadFailure::Failed(e.to_string())),
                    Err(e) => Err(DownloadFailure::Failed(format!("download task failed: {}", e))),
                },
            };
            guard.outcome = Some(outcome);
        });
    }

    /// Settle a finished download: replace or drop the placeholder, retire
    /// the ticket, enforce capacity, then wake the waiters.
    fn finish_download(&self, handle: DownloadHandle, outcome: DownloadOutcome) {
        let name = handle.name().to_string();
        {
            let mut state = self.inner.state.lock();
            match &outcome {
                Ok(image) => {
                    let seq = state.tick();
                    state.entries.insert(
                        name.clone(),
                        CacheEntry {
                            path: image.path.clone(),
                            size_bytes: image.size_bytes,
                            checksum: image.checksum.clone(),
                            last_used_at: SystemTime::now(),
                            touch_seq: seq,
                            downloading: false,
                        },
                    );
                    tracing::info!(image = %name, size_bytes = image.size_bytes, "image cached");
                }
                Err(failure) => {
                    state.entries.remove(&name);
                    tracing::warn!(image = %name, error = %failure, "image download failed");
                }
            }
            handle.retire();
            state.evict_over(self.inner.capacity);
        }
        handle.publish(outcome);
    }

    /// Evict ready entries beyond capacity. Returns the names evicted.
    pub fn evict_if_over_capacity(&self) -> Vec<String> {
        self.inner.state.lock().evict_over(self.inner.capacity)
    }

    /// Load images already present in the cache directory.
    ///
    /// Each regular file becomes a ready entry whose recency is its
    /// modification time. Leftover partial downloads are deleted. Capacity
    /// is enforced afterwards. Returns the number of images loaded.
    pub fn load_existing(&self) -> Result<usize> {
        let dir = &self.inner.dir;
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::storage("create cache dir", format!("{}: {}", dir.display(), e))
        })?;

        let mut found = Vec::new();
        let read_dir = std::fs::read_dir(dir)
            .map_err(|e| Error::storage("read cache dir", format!("{}: {}", dir.display(), e)))?;
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            let Ok(metadata) = dir_entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if name.ends_with(PARTIAL_SUFFIX) {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove stale download");
                }
                continue;
            }

            let checksum = match sha256_file(&path) {
                Ok(sum) => Some(sum),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not checksum cached image");
                    None
                }
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, name, path, metadata.len(), checksum));
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        let loaded = found.len();

        let mut state = self.inner.state.lock();
        for (modified, name, path, size_bytes, checksum) in found {
            if state.entries.contains_key(&name) {
                continue;
            }
            let seq = state.tick();
            tracing::debug!(image = %name, "loaded cached image");
            state.entries.insert(
                name,
                CacheEntry {
                    path,
                    size_bytes,
                    checksum,
                    last_used_at: modified,
                    touch_seq: seq,
                    downloading: false,
                },
            );
        }
        state.evict_over(self.inner.capacity);
        Ok(loaded)
    }
}

/// Settles a download when the fetch task ends, including by panic or abort.
struct FinishGuard {
    cache: ImageCache,
    handle: Option<DownloadHandle>,
    outcome: Option<DownloadOutcome>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let outcome = self
                .outcome
                .take()
                .unwrap_or(Err(DownloadFailure::Cancelled));
            self.cache.finish_download(handle, outcome);
        }
    }
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

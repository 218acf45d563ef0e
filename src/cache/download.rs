//! Download coordination.
//!
//! At most one download per image name is in flight. The first requester
//! gets a [`DownloadHandle`] and runs the fetch; everyone asking for the same
//! name while it runs gets a [`DownloadTicket`] for the same outcome.
//!
//! A ticket is one waiter. When the last waiter goes away before the outcome
//! is known, the shared download is cancelled.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A successfully fetched image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    /// Final location of the image in the cache directory.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Hex SHA-256 of the contents.
    pub checksum: Option<String>,
}

/// Why a download produced no image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailure {
    /// Every waiter left or the agent is shutting down.
    Cancelled,
    /// The fetch itself failed.
    Failed(String),
}

impl std::fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadFailure::Cancelled => write!(f, "download cancelled"),
            DownloadFailure::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

/// Final result broadcast to every waiter.
pub type DownloadOutcome = std::result::Result<FetchedImage, DownloadFailure>;

#[derive(Debug)]
struct Shared {
    outcome: watch::Sender<Option<DownloadOutcome>>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

/// Registry of in-flight downloads keyed by image name.
#[derive(Debug)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tickets: Mutex<HashMap<String, Arc<Shared>>>,
    shutdown: CancellationToken,
}

impl DownloadCoordinator {
    /// Create a coordinator whose downloads are all cancelled with `shutdown`.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                tickets: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Start a download for `name`, or join the one already in flight.
    ///
    /// Returns the caller's ticket, plus a handle when the caller is the one
    /// that must run the fetch.
    pub fn request_or_join(&self, name: &str) -> (DownloadTicket, Option<DownloadHandle>) {
        let mut tickets = self.inner.tickets.lock();
        if let Some(shared) = tickets.get(name) {
            return (DownloadTicket::new(shared.clone()), None);
        }

        let (tx, _rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            outcome: tx,
            waiters: AtomicUsize::new(0),
            cancel: self.inner.shutdown.child_token(),
        });
        tickets.insert(name.to_string(), shared.clone());

        let handle = DownloadHandle {
            name: name.to_string(),
            shared: shared.clone(),
            coordinator: self.inner.clone(),
            published: false,
        };
        (DownloadTicket::new(shared), Some(handle))
    }

    /// Join the download in flight for `name`, if any.
    pub fn join(&self, name: &str) -> Option<DownloadTicket> {
        self.inner
            .tickets
            .lock()
            .get(name)
            .map(|shared| DownloadTicket::new(shared.clone()))
    }

    /// Number of downloads in flight.
    pub fn len(&self) -> usize {
        self.inner.tickets.lock().len()
    }

    /// Whether no download is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the agent is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// One waiter on a download.
#[derive(Debug)]
pub struct DownloadTicket {
    shared: Arc<Shared>,
}

impl DownloadTicket {
    fn new(shared: Arc<Shared>) -> Self {
        shared.waiters.fetch_add(1, Ordering::AcqRel);
        Self { shared }
    }

    /// Wait for the outcome until `deadline`.
    ///
    /// Returns `None` if the deadline passes first. Giving up this way does
    /// not affect other waiters.
    pub async fn wait_until(&self, deadline: tokio::time::Instant) -> Option<DownloadOutcome> {
        let mut rx = self.shared.outcome.subscribe();
        let outcome = match tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => Some(outcome.clone().unwrap_or(Err(DownloadFailure::Cancelled))),
            // The sender lives in `shared`, which this ticket keeps alive.
            Ok(Err(_)) => Some(Err(DownloadFailure::Cancelled)),
            Err(_) => None,
        };
        outcome
    }
}

impl Drop for DownloadTicket {
    fn drop(&mut self) {
        let remaining = self.shared.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.shared.outcome.borrow().is_none() {
            self.shared.cancel.cancel();
        }
    }
}

/// Owner side of a download: runs the fetch and publishes its outcome.
///
/// Dropping an unpublished handle retires the ticket and publishes
/// [`DownloadFailure::Cancelled`], so waiters are never left blocked.
#[derive(Debug)]
pub struct DownloadHandle {
    name: String,
    shared: Arc<Shared>,
    coordinator: Arc<Inner>,
    published: bool,
}

impl DownloadHandle {
    /// Image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancelled when every waiter has left or the agent shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Remove the ticket so new requesters no longer join it.
    pub fn retire(&self) {
        let mut tickets = self.coordinator.tickets.lock();
        if tickets
            .get(&self.name)
            .is_some_and(|current| Arc::ptr_eq(current, &self.shared))
        {
            tickets.remove(&self.name);
        }
    }

    /// Retire the ticket and broadcast `outcome` to every waiter.
    pub fn publish(mut self, outcome: DownloadOutcome) {
        self.retire();
        self.shared.outcome.send_replace(Some(outcome));
        self.published = true;
    }
}

impl Drop for DownloadHandle {
    fn drop(&mut self) {
        if !self.published {
            self.retire();
            self.shared
                .outcome
                .send_replace(Some(Err(DownloadFailure::Cancelled)));
        }
    }
}

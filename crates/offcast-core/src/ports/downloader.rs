//! Downloader port: per-item byte transfer behind a trait object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::download::{ByteCounters, DownloadRequest, DownloadResult};

/// Sentinel stored for the total length while it is unknown.
const LENGTH_UNSET: u64 = u64::MAX;

/// Live byte-progress counters shared between a downloader and the manager.
///
/// The downloader updates these as bytes land; the manager snapshots them
/// into every record it publishes.
#[derive(Debug)]
pub struct TransferCounters {
    bytes_downloaded: AtomicU64,
    total_bytes: AtomicU64,
}

impl TransferCounters {
    /// Fresh counters: zero bytes, unknown total.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_downloaded: AtomicU64::new(0),
            total_bytes: AtomicU64::new(LENGTH_UNSET),
        }
    }

    /// Bytes fetched so far.
    #[must_use]
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// Set the absolute number of bytes fetched.
    pub fn set_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.store(bytes, Ordering::Relaxed);
    }

    /// Add to the number of bytes fetched.
    pub fn add_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the total content length once it is known.
    pub fn set_total_bytes(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    /// Snapshot for embedding into a record.
    #[must_use]
    pub fn snapshot(&self) -> ByteCounters {
        let total = self.total_bytes.load(Ordering::Relaxed);
        ByteCounters {
            bytes_downloaded: self.bytes_downloaded(),
            total_bytes: (total != LENGTH_UNSET).then_some(total),
        }
    }
}

impl Default for TransferCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches or deletes the bytes of one content item.
///
/// `download` must be resumable: a retried call continues from the bytes
/// already cached, and `downloaded_bytes` is monotonic across attempts.
/// `cancel` is advisory and idempotent; a cancelled call should return
/// promptly, with either `Ok` or `DownloadError::Cancelled`.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch the item's bytes, resuming from whatever is already cached.
    async fn download(&self) -> DownloadResult<()>;

    /// Delete the item's cached bytes.
    async fn remove(&self) -> DownloadResult<()>;

    /// Request cooperative cancellation of an in-flight call.
    fn cancel(&self);

    /// Bytes fetched so far.
    fn downloaded_bytes(&self) -> u64;

    /// Live progress counters for this item.
    fn counters(&self) -> Arc<TransferCounters>;
}

/// Creates a downloader for one request.
pub trait DownloaderFactory: Send + Sync {
    /// Build the downloader that will fetch or delete `request`'s bytes.
    fn create(&self, request: &DownloadRequest) -> Arc<dyn Downloader>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot_hides_unknown_total() {
        let counters = TransferCounters::new();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.bytes_downloaded, 0);
        assert_eq!(snapshot.total_bytes, None);

        counters.add_bytes_downloaded(100);
        counters.add_bytes_downloaded(50);
        counters.set_total_bytes(1000);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.bytes_downloaded, 150);
        assert_eq!(snapshot.total_bytes, Some(1000));
    }
}

//! Persistent stream-download manager.
//!
//! Coordinates concurrent fetch and removal workers against a bounded slot
//! pool, gated by environment requirements and manual stop reasons, with
//! per-item state persisted through a download index so downloads survive
//! restarts.
//!
//! The manager owns two long-lived tasks: a scheduler that serializes every
//! state mutation and every index write, and a dispatch task that delivers
//! listener callbacks in posted order. Workers run as their own tasks and
//! report back to the scheduler with a single completion message each.

// Re-export core types for convenience
pub use offcast_core::download::{
    DownloadError, DownloadManagerListener, DownloadRecord, DownloadRequest, DownloadState,
    FailureReason, StreamKey, STOP_REASON_NONE, STOP_REASON_UNDEFINED,
};
pub use offcast_core::ports::{
    DownloadIndex, Downloader, DownloaderFactory, RequirementsWatcher, TransferCounters,
};
pub use offcast_core::requirements::{RequirementFlags, Requirements};

mod manager;

pub use manager::{DownloadManager, DownloadManagerConfig};

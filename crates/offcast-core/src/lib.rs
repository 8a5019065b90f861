//! Core domain types and port definitions for the offcast download manager.
//!
//! This crate is pure: records, requests, requirements, and the trait
//! abstractions (`ports`) the manager consumes. No I/O happens here; the
//! SQLite index lives in `offcast-db` and the orchestration in
//! `offcast-manager`.

pub mod download;
pub mod ports;
pub mod requirements;

// Re-export commonly used types for convenience
pub use download::{
    ByteCounters, DownloadError, DownloadManagerListener, DownloadRecord, DownloadRequest,
    DownloadResult, DownloadState, FailureReason, IndexError, StreamKey, STOP_REASON_NONE,
    STOP_REASON_UNDEFINED,
};
pub use ports::{
    DownloadIndex, Downloader, DownloaderFactory, InMemoryDownloadIndex,
    ManualRequirementsWatcher, RequirementsWatcher, TransferCounters,
};
pub use requirements::{
    DeviceState, NetworkRequirement, RequirementFlags, Requirements, REQUIREMENT_CHARGING,
    REQUIREMENT_DEVICE_IDLE, REQUIREMENT_NETWORK, REQUIREMENT_NETWORK_UNMETERED,
};

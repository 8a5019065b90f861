//! Download domain types: records, requests, errors, and the listener trait.

mod errors;
mod listener;
mod record;
mod request;

pub use errors::{DownloadError, DownloadResult, IndexError};
pub use listener::DownloadManagerListener;
pub use record::{
    ByteCounters, DownloadRecord, DownloadState, FailureReason, STOP_REASON_NONE,
    STOP_REASON_UNDEFINED,
};
pub use request::{DownloadRequest, StreamKey};

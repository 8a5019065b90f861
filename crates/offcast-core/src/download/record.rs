//! Durable download records and their lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::request::{DownloadRequest, StreamKey};

/// Stop reason meaning "no manual stop"; a download with this reason may run.
pub const STOP_REASON_NONE: u32 = 0;
/// Reserved stop reason for "stopped without a specific reason".
pub const STOP_REASON_UNDEFINED: u32 = u32::MAX;

/// Lifecycle state of a download.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Eligible to run but waiting for a fetch slot.
    Queued,
    /// Held back by a manual stop reason or unmet requirements.
    Stopped,
    /// A fetch worker is bound to the download.
    Downloading,
    /// All bytes fetched.
    Completed,
    /// Fetching gave up after exhausting retries.
    Failed,
    /// A removal worker is deleting the cached bytes.
    Removing,
    /// Cached bytes are being deleted before the download is fetched again.
    Restarting,
    /// Cached bytes are gone and the record is dropped.
    Removed,
}

impl DownloadState {
    /// String representation used for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Stopped => "stopped",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Removing => "removing",
            Self::Restarting => "restarting",
            Self::Removed => "removed",
        }
    }

    /// Parse from the storage representation. Unknown values default to
    /// `Queued` so a record is never lost to a bad row.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "stopped" => Self::Stopped,
            "downloading" => Self::Downloading,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "removing" => Self::Removing,
            "restarting" => Self::Restarting,
            "removed" => Self::Removed,
            _ => Self::Queued,
        }
    }

    /// Terminal states never transition further and are dropped from the
    /// live collection once published.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Removed)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a download ended up failed. Meaningful only while the state is
/// `Failed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Not failed, or failed for a reason that was never recorded.
    #[default]
    None,
    /// The fetch worker exhausted its retries.
    Unknown,
}

impl FailureReason {
    /// String representation used for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "unknown" => Self::Unknown,
            _ => Self::None,
        }
    }
}

/// Snapshot of byte-progress counters. Transient: carried on records for
/// observers, persisted only best-effort.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCounters {
    /// Bytes fetched so far.
    pub bytes_downloaded: u64,
    /// Total content length when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

/// The persisted unit: one row per content id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Stable unique content id, the primary key.
    pub id: String,
    /// Opaque content-type tag.
    pub content_type: String,
    /// Where the bytes come from.
    pub uri: String,
    /// Cache key override.
    pub cache_key: Option<String>,
    /// Streams to fetch; empty means everything.
    pub stream_keys: Vec<StreamKey>,
    /// Application data, never interpreted.
    pub custom_metadata: Vec<u8>,
    /// Lifecycle state.
    pub state: DownloadState,
    /// Failure reason; `None` unless `state` is `Failed`.
    pub failure_reason: FailureReason,
    /// Not-met requirement flags at the last update.
    pub not_met_requirements: u32,
    /// Manual stop reason at the last update; `STOP_REASON_NONE` means the
    /// download may run.
    pub manual_stop_reason: u32,
    /// When the record was first created, in Unix milliseconds.
    pub start_time_ms: u64,
    /// When the record was last updated, in Unix milliseconds.
    pub update_time_ms: u64,
    /// Byte-progress snapshot.
    pub counters: ByteCounters,
}

impl DownloadRecord {
    /// Build a fresh record for a new request, starting queued.
    #[must_use]
    pub fn for_request(request: &DownloadRequest, now_ms: u64) -> Self {
        Self {
            id: request.id.clone(),
            content_type: request.content_type.clone(),
            uri: request.uri.clone(),
            cache_key: request.cache_key.clone(),
            stream_keys: request.stream_keys.clone(),
            custom_metadata: request.custom_metadata.clone(),
            state: DownloadState::Queued,
            failure_reason: FailureReason::None,
            not_met_requirements: 0,
            manual_stop_reason: STOP_REASON_NONE,
            start_time_ms: now_ms,
            update_time_ms: now_ms,
            counters: ByteCounters::default(),
        }
    }

    /// Merge a new request into this record.
    ///
    /// Stream keys are unioned preserving order; uri, cache key, and metadata
    /// are replaced; the failure reason is cleared. The state pivots so the
    /// new fetch can happen: a removing or restarting record becomes
    /// restarting (refetch once removal finishes), a terminal record is
    /// re-queued, anything else keeps its state.
    #[must_use]
    pub fn merge_request(&self, request: &DownloadRequest, now_ms: u64) -> Self {
        if self.content_type != request.content_type {
            tracing::warn!(
                id = %self.id,
                existing = %self.content_type,
                incoming = %request.content_type,
                "request content type does not match existing download"
            );
        }
        let state = match self.state {
            DownloadState::Removing | DownloadState::Restarting => DownloadState::Restarting,
            s if s.is_terminal() => DownloadState::Queued,
            s => s,
        };
        let mut stream_keys = self.stream_keys.clone();
        for key in &request.stream_keys {
            if !stream_keys.contains(key) {
                stream_keys.push(*key);
            }
        }
        Self {
            id: self.id.clone(),
            content_type: self.content_type.clone(),
            uri: request.uri.clone(),
            cache_key: request.cache_key.clone(),
            stream_keys,
            custom_metadata: request.custom_metadata.clone(),
            state,
            failure_reason: FailureReason::None,
            not_met_requirements: self.not_met_requirements,
            manual_stop_reason: self.manual_stop_reason,
            start_time_ms: self.start_time_ms,
            update_time_ms: now_ms,
            counters: self.counters,
        }
    }

    /// Rebuild the fetch request this record describes.
    #[must_use]
    pub fn to_request(&self) -> DownloadRequest {
        DownloadRequest {
            id: self.id.clone(),
            content_type: self.content_type.clone(),
            uri: self.uri.clone(),
            stream_keys: self.stream_keys.clone(),
            cache_key: self.cache_key.clone(),
            custom_metadata: self.custom_metadata.clone(),
        }
    }
}

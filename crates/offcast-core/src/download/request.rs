//! Fetch requests and stream selection keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one stream inside a multi-period manifest.
///
/// Keys are compared structurally; a request carrying an empty key list asks
/// for every stream of the content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// 0-based period index.
    pub period_index: u32,
    /// 0-based stream group index within the period.
    pub group_index: u32,
    /// 0-based track index within the group.
    pub track_index: u32,
}

impl StreamKey {
    /// Create a new stream key.
    #[must_use]
    pub const fn new(period_index: u32, group_index: u32, track_index: u32) -> Self {
        Self {
            period_index,
            group_index,
            track_index,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.period_index, self.group_index, self.track_index
        )
    }
}

/// A request to download (or re-download) one content item.
///
/// `id` is the stable primary key; adding a request for an id that already
/// exists merges into the stored record instead of creating a second entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Stable unique content id.
    pub id: String,
    /// Opaque content-type tag, checked (but not enforced) on merge.
    pub content_type: String,
    /// Where the bytes come from.
    pub uri: String,
    /// Streams to fetch; empty means everything.
    pub stream_keys: Vec<StreamKey>,
    /// Cache key override, if the cache layout needs one.
    pub cache_key: Option<String>,
    /// Application data carried with the record, never interpreted.
    pub custom_metadata: Vec<u8>,
}

impl DownloadRequest {
    /// Create a request with no stream selection, cache key, or metadata.
    pub fn new(id: impl Into<String>, content_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content_type: content_type.into(),
            uri: uri.into(),
            stream_keys: Vec::new(),
            cache_key: None,
            custom_metadata: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_display() {
        assert_eq!(StreamKey::new(0, 1, 2).to_string(), "0.1.2");
    }

    #[test]
    fn request_new_defaults() {
        let request = DownloadRequest::new("id", "dash", "https://example.com/a.mpd");
        assert!(request.stream_keys.is_empty());
        assert!(request.cache_key.is_none());
        assert!(request.custom_metadata.is_empty());
    }
}

//! Download index port: durable id → record storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::download::{DownloadRecord, DownloadState, IndexError};

/// Port for the durable download index.
///
/// Every operation may fail with a storage error; the manager logs and
/// swallows these, so the in-memory state stays authoritative until the
/// next successful commit. Mutating an absent id is a no-op, not an error.
#[async_trait]
pub trait DownloadIndex: Send + Sync {
    /// Load one record.
    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>, IndexError>;

    /// Load every record whose state is one of `states`, ordered by creation
    /// time.
    async fn list_by_state(
        &self,
        states: &[DownloadState],
    ) -> Result<Vec<DownloadRecord>, IndexError>;

    /// Insert or replace a record.
    async fn put(&self, record: &DownloadRecord) -> Result<(), IndexError>;

    /// Delete a record.
    async fn delete(&self, id: &str) -> Result<(), IndexError>;

    /// Set the manual stop reason of every record.
    async fn set_stop_reason_all(&self, reason: u32) -> Result<(), IndexError>;

    /// Set the manual stop reason of one record.
    async fn set_stop_reason(&self, id: &str, reason: u32) -> Result<(), IndexError>;
}

/// Hash-map index for tests and embedders that do not need durability.
#[derive(Debug, Default)]
pub struct InMemoryDownloadIndex {
    records: Mutex<HashMap<String, DownloadRecord>>,
}

impl InMemoryDownloadIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record synchronously, bypassing the async port.
    pub fn insert(&self, record: DownloadRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }
}

#[async_trait]
impl DownloadIndex for InMemoryDownloadIndex {
    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>, IndexError> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn list_by_state(
        &self,
        states: &[DownloadState],
    ) -> Result<Vec<DownloadRecord>, IndexError> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| states.contains(&record.state))
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.start_time_ms, record.id.clone()));
        Ok(records)
    }

    async fn put(&self, record: &DownloadRecord) -> Result<(), IndexError> {
        self.insert(record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    async fn set_stop_reason_all(&self, reason: u32) -> Result<(), IndexError> {
        for record in self.records.lock().unwrap().values_mut() {
            record.manual_stop_reason = reason;
        }
        Ok(())
    }

    async fn set_stop_reason(&self, id: &str, reason: u32) -> Result<(), IndexError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(id) {
            record.manual_stop_reason = reason;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadRequest;

    fn record(id: &str, state: DownloadState, start_time_ms: u64) -> DownloadRecord {
        let mut record = DownloadRecord::for_request(
            &DownloadRequest::new(id, "hls", format!("https://example.com/{id}.m3u8")),
            start_time_ms,
        );
        record.state = state;
        record
    }

    #[tokio::test]
    async fn put_get_delete() {
        let index = InMemoryDownloadIndex::new();
        assert!(index.get("a").await.unwrap().is_none());

        index
            .put(&record("a", DownloadState::Queued, 1))
            .await
            .unwrap();
        assert_eq!(index.get("a").await.unwrap().unwrap().id, "a");

        index.delete("a").await.unwrap();
        assert!(index.get("a").await.unwrap().is_none());

        // Deleting an absent id is a no-op.
        index.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_and_orders_by_start_time() {
        let index = InMemoryDownloadIndex::new();
        index.insert(record("later", DownloadState::Queued, 5));
        index.insert(record("earlier", DownloadState::Stopped, 2));
        index.insert(record("done", DownloadState::Completed, 1));

        let listed = index
            .list_by_state(&[DownloadState::Queued, DownloadState::Stopped])
            .await
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["earlier", "later"]);
    }

    #[tokio::test]
    async fn stop_reason_mutations() {
        let index = InMemoryDownloadIndex::new();
        index.insert(record("a", DownloadState::Queued, 1));
        index.insert(record("b", DownloadState::Stopped, 2));

        index.set_stop_reason("a", 7).await.unwrap();
        assert_eq!(index.get("a").await.unwrap().unwrap().manual_stop_reason, 7);
        assert_eq!(index.get("b").await.unwrap().unwrap().manual_stop_reason, 0);

        index.set_stop_reason_all(9).await.unwrap();
        assert_eq!(index.get("a").await.unwrap().unwrap().manual_stop_reason, 9);
        assert_eq!(index.get("b").await.unwrap().unwrap().manual_stop_reason, 9);

        // Absent id is a no-op.
        index.set_stop_reason("missing", 3).await.unwrap();
    }
}

//! `SQLite` implementation of the `DownloadIndex` port.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use offcast_core::download::{
    ByteCounters, DownloadRecord, DownloadState, FailureReason, IndexError, StreamKey,
};
use offcast_core::ports::DownloadIndex;

/// Create the download index table if it does not exist yet.
pub async fn setup_download_index(pool: &SqlitePool) -> Result<(), IndexError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY NOT NULL,
            content_type TEXT NOT NULL,
            uri TEXT NOT NULL,
            cache_key TEXT,
            stream_keys TEXT NOT NULL,
            custom_metadata BLOB NOT NULL,
            state TEXT NOT NULL,
            failure_reason TEXT NOT NULL DEFAULT 'none',
            not_met_requirements INTEGER NOT NULL DEFAULT 0,
            manual_stop_reason INTEGER NOT NULL DEFAULT 0,
            start_time_ms INTEGER NOT NULL,
            update_time_ms INTEGER NOT NULL,
            bytes_downloaded INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(storage_error)?;

    Ok(())
}

/// `SQLite` download index.
///
/// Persists one row per content id so downloads survive restarts.
pub struct SqliteDownloadIndex {
    pool: SqlitePool,
}

impl SqliteDownloadIndex {
    /// Create an index over an existing pool. The schema must have been set
    /// up with [`setup_download_index`].
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DownloadIndex for SqliteDownloadIndex {
    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>, IndexError> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_by_state(
        &self,
        states: &[DownloadState],
    ) -> Result<Vec<DownloadRecord>, IndexError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT * FROM downloads WHERE state IN ({placeholders}) ORDER BY start_time_ms ASC, id ASC"
        );

        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn put(&self, record: &DownloadRecord) -> Result<(), IndexError> {
        let stream_keys = serde_json::to_string(&record.stream_keys)
            .map_err(|e| IndexError::Storage(format!("stream keys encode error: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, content_type, uri, cache_key, stream_keys, custom_metadata,
                state, failure_reason, not_met_requirements, manual_stop_reason,
                start_time_ms, update_time_ms, bytes_downloaded, total_bytes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content_type = excluded.content_type,
                uri = excluded.uri,
                cache_key = excluded.cache_key,
                stream_keys = excluded.stream_keys,
                custom_metadata = excluded.custom_metadata,
                state = excluded.state,
                failure_reason = excluded.failure_reason,
                not_met_requirements = excluded.not_met_requirements,
                manual_stop_reason = excluded.manual_stop_reason,
                update_time_ms = excluded.update_time_ms,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes
            "#,
        )
        .bind(&record.id)
        .bind(&record.content_type)
        .bind(&record.uri)
        .bind(&record.cache_key)
        .bind(&stream_keys)
        .bind(&record.custom_metadata)
        .bind(record.state.as_str())
        .bind(record.failure_reason.as_str())
        .bind(i64::from(record.not_met_requirements))
        .bind(i64::from(record.manual_stop_reason))
        .bind(record.start_time_ms as i64)
        .bind(record.update_time_ms as i64)
        .bind(record.counters.bytes_downloaded as i64)
        .bind(record.counters.total_bytes.map(|t| t as i64))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    async fn set_stop_reason_all(&self, reason: u32) -> Result<(), IndexError> {
        sqlx::query("UPDATE downloads SET manual_stop_reason = ?")
            .bind(i64::from(reason))
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    async fn set_stop_reason(&self, id: &str, reason: u32) -> Result<(), IndexError> {
        sqlx::query("UPDATE downloads SET manual_stop_reason = ? WHERE id = ?")
            .bind(i64::from(reason))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(())
    }
}

/// Convert a database row to a `DownloadRecord`.
fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<DownloadRecord, IndexError> {
    let id: String = row.try_get("id").map_err(storage_error)?;
    let content_type: String = row.try_get("content_type").map_err(storage_error)?;
    let uri: String = row.try_get("uri").map_err(storage_error)?;
    let cache_key: Option<String> = row.try_get("cache_key").map_err(storage_error)?;
    let stream_keys_json: String = row.try_get("stream_keys").map_err(storage_error)?;
    let custom_metadata: Vec<u8> = row.try_get("custom_metadata").map_err(storage_error)?;
    let state: String = row.try_get("state").map_err(storage_error)?;
    let failure_reason: String = row.try_get("failure_reason").map_err(storage_error)?;
    let not_met_requirements: i64 = row
        .try_get("not_met_requirements")
        .map_err(storage_error)?;
    let manual_stop_reason: i64 = row.try_get("manual_stop_reason").map_err(storage_error)?;
    let start_time_ms: i64 = row.try_get("start_time_ms").map_err(storage_error)?;
    let update_time_ms: i64 = row.try_get("update_time_ms").map_err(storage_error)?;
    let bytes_downloaded: i64 = row.try_get("bytes_downloaded").map_err(storage_error)?;
    let total_bytes: Option<i64> = row.try_get("total_bytes").map_err(storage_error)?;

    let stream_keys: Vec<StreamKey> = serde_json::from_str(&stream_keys_json)
        .map_err(|e| IndexError::Storage(format!("stream keys decode error: {e}")))?;

    Ok(DownloadRecord {
        id,
        content_type,
        uri,
        cache_key,
        stream_keys,
        custom_metadata,
        state: DownloadState::parse(&state),
        failure_reason: FailureReason::parse(&failure_reason),
        not_met_requirements: not_met_requirements as u32,
        manual_stop_reason: manual_stop_reason as u32,
        start_time_ms: start_time_ms as u64,
        update_time_ms: update_time_ms as u64,
        counters: ByteCounters {
            bytes_downloaded: bytes_downloaded as u64,
            total_bytes: total_bytes.map(|t| t as u64),
        },
    })
}

fn storage_error(e: impl std::fmt::Display) -> IndexError {
    IndexError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offcast_core::download::{DownloadRequest, STOP_REASON_UNDEFINED};

    async fn setup_test_index() -> SqliteDownloadIndex {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        setup_download_index(&pool).await.unwrap();
        SqliteDownloadIndex::new(pool)
    }

    fn record(id: &str, state: DownloadState, start_time_ms: u64) -> DownloadRecord {
        let mut request =
            DownloadRequest::new(id, "dash", format!("https://example.com/{id}.mpd"));
        request.stream_keys = vec![StreamKey::new(0, 1, 2)];
        request.custom_metadata = vec![0xde, 0xad];
        let mut record = DownloadRecord::for_request(&request, start_time_ms);
        record.state = state;
        record
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let index = setup_test_index().await;
        let mut original = record("a", DownloadState::Downloading, 10);
        original.cache_key = Some("cache-a".to_string());
        original.counters = ByteCounters {
            bytes_downloaded: 512,
            total_bytes: Some(2048),
        };

        index.put(&original).await.unwrap();

        let loaded = index.get("a").await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(index.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_twice_is_an_upsert() {
        let index = setup_test_index().await;
        let mut rec = record("a", DownloadState::Queued, 10);
        index.put(&rec).await.unwrap();

        rec.state = DownloadState::Completed;
        rec.update_time_ms = 20;
        index.put(&rec).await.unwrap();

        let loaded = index.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.state, DownloadState::Completed);
        assert_eq!(loaded.update_time_ms, 20);
    }

    #[tokio::test]
    async fn list_by_state_filters_and_orders() {
        let index = setup_test_index().await;
        index
            .put(&record("later", DownloadState::Queued, 30))
            .await
            .unwrap();
        index
            .put(&record("earlier", DownloadState::Stopped, 10))
            .await
            .unwrap();
        index
            .put(&record("done", DownloadState::Completed, 20))
            .await
            .unwrap();

        let listed = index
            .list_by_state(&[DownloadState::Queued, DownloadState::Stopped])
            .await
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["earlier", "later"]);

        assert!(index.list_by_state(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let index = setup_test_index().await;
        index
            .put(&record("a", DownloadState::Removed, 10))
            .await
            .unwrap();

        index.delete("a").await.unwrap();
        assert!(index.get("a").await.unwrap().is_none());

        // Absent id is a no-op.
        index.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn stop_reason_mutations() {
        let index = setup_test_index().await;
        index
            .put(&record("a", DownloadState::Queued, 10))
            .await
            .unwrap();
        index
            .put(&record("b", DownloadState::Stopped, 20))
            .await
            .unwrap();

        index.set_stop_reason("a", 7).await.unwrap();
        assert_eq!(index.get("a").await.unwrap().unwrap().manual_stop_reason, 7);
        assert_eq!(index.get("b").await.unwrap().unwrap().manual_stop_reason, 0);

        index
            .set_stop_reason_all(STOP_REASON_UNDEFINED)
            .await
            .unwrap();
        assert_eq!(
            index.get("a").await.unwrap().unwrap().manual_stop_reason,
            STOP_REASON_UNDEFINED
        );
        assert_eq!(
            index.get("b").await.unwrap().unwrap().manual_stop_reason,
            STOP_REASON_UNDEFINED
        );

        // Absent id is a no-op.
        index.set_stop_reason("missing", 3).await.unwrap();
    }
}

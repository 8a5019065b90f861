//! Per-item state data owned by the scheduler.

use std::sync::Arc;

use offcast_core::download::{
    DownloadRecord, DownloadRequest, DownloadState, FailureReason, STOP_REASON_NONE,
};
use offcast_core::ports::TransferCounters;
use offcast_core::requirements::RequirementFlags;

/// In-memory state of one download.
///
/// Transitions live on the scheduler because they need the worker table and
/// the slot bookkeeping; this struct carries the fields a transition reads
/// plus the pure record rematerialization.
pub(crate) struct Download {
    /// Last materialized record. Lags the live fields by at most one event.
    pub(crate) record: DownloadRecord,
    /// Effective lifecycle state.
    pub(crate) state: DownloadState,
    /// Effective failure reason; only meaningful once `state` is `Failed`.
    pub(crate) failure_reason: FailureReason,
    /// Effective not-met requirement flags.
    pub(crate) not_met_requirements: RequirementFlags,
    /// Effective manual stop reason.
    pub(crate) manual_stop_reason: u32,
    /// Live counters of the bound worker's downloader, if any was ever bound.
    pub(crate) counters: Option<Arc<TransferCounters>>,
}

impl Download {
    pub(crate) fn new(
        record: DownloadRecord,
        not_met_requirements: RequirementFlags,
        manual_stop_reason: u32,
    ) -> Self {
        let state = record.state;
        Self {
            record,
            state,
            failure_reason: FailureReason::None,
            not_met_requirements,
            manual_stop_reason,
            counters: None,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.record.id
    }

    /// Admission precondition: no manual stop and every requirement met.
    pub(crate) fn can_start(&self) -> bool {
        self.manual_stop_reason == STOP_REASON_NONE && self.not_met_requirements == 0
    }

    /// No worker should be running for this download.
    pub(crate) fn is_idle(&self) -> bool {
        !matches!(
            self.state,
            DownloadState::Downloading | DownloadState::Removing | DownloadState::Restarting
        )
    }

    pub(crate) fn is_in_remove_state(&self) -> bool {
        matches!(
            self.state,
            DownloadState::Removing | DownloadState::Restarting
        )
    }

    pub(crate) fn request(&self) -> DownloadRequest {
        self.record.to_request()
    }

    pub(crate) fn merge_request(&mut self, request: &DownloadRequest, now_ms: u64) {
        self.record = self.record.merge_request(request, now_ms);
    }

    /// Rematerialize the record from the effective fields. The result is
    /// what gets persisted and what listeners observe.
    pub(crate) fn updated_record(&mut self, now_ms: u64) -> DownloadRecord {
        let counters = self
            .counters
            .as_ref()
            .map_or(self.record.counters, |counters| counters.snapshot());
        self.record = DownloadRecord {
            state: self.state,
            failure_reason: if self.state == DownloadState::Failed {
                self.failure_reason
            } else {
                FailureReason::None
            },
            not_met_requirements: self.not_met_requirements,
            manual_stop_reason: self.manual_stop_reason,
            update_time_ms: now_ms,
            counters,
            ..self.record.clone()
        };
        self.record.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offcast_core::download::STOP_REASON_UNDEFINED;

    fn download(state: DownloadState) -> Download {
        let request = DownloadRequest::new("a", "dash", "https://example.com/a.mpd");
        let mut record = DownloadRecord::for_request(&request, 1);
        record.state = state;
        Download::new(record, 0, STOP_REASON_NONE)
    }

    #[test]
    fn can_start_needs_no_stop_reason_and_met_requirements() {
        let mut d = download(DownloadState::Queued);
        assert!(d.can_start());

        d.manual_stop_reason = STOP_REASON_UNDEFINED;
        assert!(!d.can_start());

        d.manual_stop_reason = STOP_REASON_NONE;
        d.not_met_requirements = 1;
        assert!(!d.can_start());
    }

    #[test]
    fn idle_and_remove_state_classification() {
        assert!(download(DownloadState::Queued).is_idle());
        assert!(download(DownloadState::Stopped).is_idle());
        assert!(!download(DownloadState::Downloading).is_idle());
        assert!(!download(DownloadState::Removing).is_idle());
        assert!(!download(DownloadState::Restarting).is_idle());

        assert!(download(DownloadState::Removing).is_in_remove_state());
        assert!(download(DownloadState::Restarting).is_in_remove_state());
        assert!(!download(DownloadState::Downloading).is_in_remove_state());
    }

    #[test]
    fn updated_record_reflects_effective_fields() {
        let mut d = download(DownloadState::Queued);
        d.state = DownloadState::Downloading;
        d.not_met_requirements = 2;
        d.manual_stop_reason = 5;

        let counters = Arc::new(TransferCounters::new());
        counters.add_bytes_downloaded(33);
        d.counters = Some(counters);

        let record = d.updated_record(99);
        assert_eq!(record.state, DownloadState::Downloading);
        assert_eq!(record.failure_reason, FailureReason::None);
        assert_eq!(record.not_met_requirements, 2);
        assert_eq!(record.manual_stop_reason, 5);
        assert_eq!(record.update_time_ms, 99);
        assert_eq!(record.counters.bytes_downloaded, 33);
        // The materialized record is retained for the next lag comparison.
        assert_eq!(d.record, record);
    }

    #[test]
    fn failure_reason_only_survives_in_failed_state() {
        let mut d = download(DownloadState::Downloading);
        d.failure_reason = FailureReason::Unknown;

        let record = d.updated_record(1);
        assert_eq!(record.failure_reason, FailureReason::None);

        d.state = DownloadState::Failed;
        let record = d.updated_record(2);
        assert_eq!(record.failure_reason, FailureReason::Unknown);
    }
}

//! The serialized scheduler: owns every download, every worker, and all
//! index I/O.
//!
//! One task processes messages strictly in posted order. Workers never touch
//! shared state; their completions come back through the same message
//! channel. Idle is evaluated once per processed message so listeners never
//! see a transient empty worker table in the middle of an event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use offcast_core::download::{
    DownloadError, DownloadRecord, DownloadRequest, DownloadState, FailureReason,
    STOP_REASON_NONE,
};
use offcast_core::ports::{DownloadIndex, Downloader, DownloaderFactory};
use offcast_core::requirements::RequirementFlags;

use super::download::Download;
use super::{worker, DownloadManagerConfig, Notification};

/// Messages processed by the scheduler loop.
pub(crate) enum Message {
    /// Add a new download or merge into an existing one.
    Add(DownloadRequest),
    /// Remove a download and its cached bytes.
    Remove(String),
    /// Set the manual stop reason of one download, or of all of them.
    SetStopReason { id: Option<String>, reason: u32 },
    /// The requirements watcher reported new not-met flags.
    SetNotMetRequirements(RequirementFlags),
    /// A worker finished; `error` is None on success or cancellation.
    WorkerStopped {
        id: String,
        worker_id: u64,
        error: Option<DownloadError>,
    },
    /// Cancel all workers and quit once pending work has drained.
    Release(oneshot::Sender<()>),
}

/// Outcome of asking for a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartWorker {
    /// A fresh worker was created and bound to the download.
    Succeeded,
    /// A removal worker is already running; retry on its completion.
    WaitRemovalToFinish,
    /// The running fetch worker was cancelled; its completion event
    /// re-drives the state machine.
    WaitDownloadCancellation,
    /// Every fetch slot is taken.
    TooManyDownloads,
}

/// Handle to a running worker task.
struct ActiveWorker {
    worker_id: u64,
    is_remove: bool,
    is_canceled: bool,
    cancel: CancellationToken,
    downloader: Arc<dyn Downloader>,
}

impl ActiveWorker {
    fn cancel(&mut self) {
        self.is_canceled = true;
        self.cancel.cancel();
        self.downloader.cancel();
    }
}

pub(crate) struct Scheduler {
    index: Arc<dyn DownloadIndex>,
    downloader_factory: Arc<dyn DownloaderFactory>,
    max_simultaneous_downloads: usize,
    min_retry_count: u32,
    downloads: Vec<Download>,
    active: HashMap<String, ActiveWorker>,
    simultaneous_downloads: usize,
    not_met_requirements: RequirementFlags,
    manual_stop_reason: u32,
    next_worker_id: u64,
    completions: mpsc::UnboundedSender<Message>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl Scheduler {
    pub(crate) fn new(
        index: Arc<dyn DownloadIndex>,
        downloader_factory: Arc<dyn DownloaderFactory>,
        config: &DownloadManagerConfig,
        not_met_requirements: RequirementFlags,
        completions: mpsc::UnboundedSender<Message>,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            index,
            downloader_factory,
            max_simultaneous_downloads: config.max_simultaneous_downloads,
            min_retry_count: config.min_retry_count,
            downloads: Vec::new(),
            active: HashMap::new(),
            simultaneous_downloads: 0,
            not_met_requirements,
            manual_stop_reason: STOP_REASON_NONE,
            next_worker_id: 0,
            completions,
            notifications,
        }
    }

    pub(crate) async fn run(mut self, mut messages: mpsc::UnboundedReceiver<Message>) {
        self.load_downloads().await;
        self.check_idle();
        while let Some(message) = messages.recv().await {
            match message {
                Message::Add(request) => self.add_download(request).await,
                Message::Remove(id) => self.remove_download(&id).await,
                Message::SetStopReason { id, reason } => {
                    self.set_stop_reason(id.as_deref(), reason).await;
                }
                Message::SetNotMetRequirements(flags) => {
                    self.set_not_met_requirements(flags).await;
                }
                Message::WorkerStopped {
                    id,
                    worker_id,
                    error,
                } => self.on_worker_stopped(&id, worker_id, error).await,
                Message::Release(ack) => {
                    self.release(ack);
                    return;
                }
            }
            self.check_idle();
        }
    }

    // --- Startup ---

    async fn load_downloads(&mut self) {
        const LOADED_STATES: &[DownloadState] = &[
            DownloadState::Queued,
            DownloadState::Stopped,
            DownloadState::Downloading,
            DownloadState::Removing,
            DownloadState::Restarting,
        ];

        let records = match self.index.list_by_state(LOADED_STATES).await {
            Ok(records) => records,
            Err(error) => {
                tracing::error!(%error, "loading download records failed");
                Vec::new()
            }
        };
        for record in records {
            self.insert_download(record).await;
        }
        tracing::debug!(count = self.downloads.len(), "downloads restored");
        let _ = self.notifications.send(Notification::Initialized);

        let mut i = 0;
        while i < self.downloads.len() {
            self.start(i).await;
            i += 1;
        }
    }

    // --- Message handlers ---

    async fn add_download(&mut self, request: DownloadRequest) {
        if let Some(idx) = self.find_download(&request.id) {
            tracing::debug!(id = %request.id, "request merged into existing download");
            self.downloads[idx].merge_request(&request, now_ms());
            let merged_state = self.downloads[idx].record.state;
            self.initialize(idx, merged_state).await;
            return;
        }

        let record = match self.load_record(&request.id).await {
            Some(existing) => {
                tracing::debug!(id = %request.id, "request merged into persisted record");
                existing.merge_request(&request, now_ms())
            }
            None => {
                tracing::debug!(id = %request.id, "record created");
                DownloadRecord::for_request(&request, now_ms())
            }
        };
        self.insert_download(record).await;
    }

    async fn remove_download(&mut self, id: &str) {
        if let Some(idx) = self.find_download(id) {
            self.initialize(idx, DownloadState::Removing).await;
            return;
        }
        match self.load_record(id).await {
            Some(mut record) => {
                record.state = DownloadState::Removing;
                self.insert_download(record).await;
            }
            None => tracing::debug!(id, "nothing to remove"),
        }
    }

    async fn set_stop_reason(&mut self, id: Option<&str>, reason: u32) {
        if let Some(id) = id {
            if let Some(idx) = self.find_download(id) {
                tracing::debug!(id, reason, "manual stop reason set");
                self.downloads[idx].manual_stop_reason = reason;
                self.update_stop_state(idx).await;
                // The publish above already persisted the new reason.
                return;
            }
            if let Err(error) = self.index.set_stop_reason(id, reason).await {
                tracing::error!(%error, id, "persisting stop reason failed");
            }
        } else {
            tracing::debug!(reason, "manual stop reason set for all downloads");
            self.manual_stop_reason = reason;
            let mut i = 0;
            while i < self.downloads.len() {
                self.downloads[i].manual_stop_reason = reason;
                self.update_stop_state(i).await;
                i += 1;
            }
            if let Err(error) = self.index.set_stop_reason_all(reason).await {
                tracing::error!(%error, "persisting stop reason failed");
            }
        }
    }

    async fn set_not_met_requirements(&mut self, flags: RequirementFlags) {
        tracing::debug!(flags, "not met requirements changed");
        self.not_met_requirements = flags;
        let mut i = 0;
        while i < self.downloads.len() {
            self.downloads[i].not_met_requirements = flags;
            self.update_stop_state(i).await;
            i += 1;
        }
    }

    async fn on_worker_stopped(&mut self, id: &str, worker_id: u64, error: Option<DownloadError>) {
        let matches = self
            .active
            .get(id)
            .is_some_and(|active| active.worker_id == worker_id);
        if !matches {
            tracing::debug!(id, worker_id, "stale worker completion ignored");
            return;
        }
        let Some(stopped) = self.active.remove(id) else {
            return;
        };
        tracing::debug!(id, "worker stopped");

        let mut try_to_start = false;
        if !stopped.is_remove {
            // If the cap was hit, a download may be parked waiting for this
            // slot.
            try_to_start = self.simultaneous_downloads == self.max_simultaneous_downloads;
            self.simultaneous_downloads -= 1;
        }

        if let Some(idx) = self.find_download(id) {
            self.on_download_worker_stopped(idx, stopped.is_canceled, error)
                .await;
        } else {
            tracing::debug!(id, "completion for unknown download ignored");
        }

        if try_to_start {
            let mut i = 0;
            while self.simultaneous_downloads < self.max_simultaneous_downloads
                && i < self.downloads.len()
            {
                self.start(i).await;
                i += 1;
            }
        }
    }

    fn release(&mut self, ack: oneshot::Sender<()>) {
        for active in self.active.values_mut() {
            active.cancel();
        }
        // The dispatch task acknowledges after delivering everything queued
        // ahead of the marker, so nothing reaches listeners once release
        // returns.
        let _ = self.notifications.send(Notification::Shutdown(ack));
        tracing::debug!("scheduler released");
    }

    // --- Download state machine ---
    //
    // Transitions return whether they emitted a record so an outer
    // transition can skip its own emission when an inner one already fired;
    // every event ends up publishing exactly once.

    async fn initialize(&mut self, idx: usize, initial_state: DownloadState) {
        self.downloads[idx].state = initial_state;
        let emitted = if self.downloads[idx].is_in_remove_state() {
            self.start_worker(idx);
            false
        } else if self.downloads[idx].can_start() {
            self.start_or_queue(idx).await
        } else {
            self.set_state(idx, DownloadState::Stopped).await
        };
        if !emitted {
            // Publish even when nothing moved: listeners bootstrapping from
            // a restart need the notification for the initial state too.
            self.publish(idx).await;
        }
    }

    async fn start(&mut self, idx: usize) {
        if matches!(
            self.downloads[idx].state,
            DownloadState::Queued | DownloadState::Downloading
        ) {
            self.start_or_queue(idx).await;
        } else if self.downloads[idx].is_in_remove_state() {
            self.start_worker(idx);
        }
    }

    async fn update_stop_state(&mut self, idx: usize) {
        let emitted = if self.downloads[idx].can_start() {
            if self.downloads[idx].state == DownloadState::Stopped {
                self.start_or_queue(idx).await
            } else {
                false
            }
        } else if matches!(
            self.downloads[idx].state,
            DownloadState::Downloading | DownloadState::Queued
        ) {
            let id = self.downloads[idx].id().to_owned();
            self.stop_worker(&id);
            self.set_state(idx, DownloadState::Stopped).await
        } else {
            false
        };
        if !emitted {
            // The effective stop fields changed even if the state did not.
            self.publish(idx).await;
        }
    }

    async fn start_or_queue(&mut self, idx: usize) -> bool {
        debug_assert!(!self.downloads[idx].is_in_remove_state());
        let result = self.start_worker(idx);
        debug_assert!(result != StartWorker::WaitRemovalToFinish);
        match result {
            StartWorker::Succeeded | StartWorker::WaitDownloadCancellation => {
                self.set_state(idx, DownloadState::Downloading).await
            }
            _ => self.set_state(idx, DownloadState::Queued).await,
        }
    }

    async fn on_download_worker_stopped(
        &mut self,
        idx: usize,
        is_canceled: bool,
        error: Option<DownloadError>,
    ) {
        if self.downloads[idx].is_idle() {
            tracing::debug!(id = %self.downloads[idx].id(), "spurious worker completion ignored");
            return;
        }
        if is_canceled {
            // A preempted worker finished; admit whatever the current state
            // wants, which may now be a removal instead of a fetch.
            self.start_worker(idx);
        } else if self.downloads[idx].state == DownloadState::Restarting {
            self.initialize(idx, DownloadState::Queued).await;
        } else if self.downloads[idx].state == DownloadState::Removing {
            if let Some(error) = &error {
                tracing::error!(
                    id = %self.downloads[idx].id(),
                    %error,
                    "removal failed; the download is dropped regardless"
                );
            }
            self.set_state(idx, DownloadState::Removed).await;
        } else {
            // state == Downloading
            if let Some(error) = &error {
                tracing::error!(id = %self.downloads[idx].id(), %error, "download failed");
                self.downloads[idx].failure_reason = FailureReason::Unknown;
                self.set_state(idx, DownloadState::Failed).await;
            } else {
                self.set_state(idx, DownloadState::Completed).await;
            }
        }
    }

    /// Move to `new_state` and publish. Returns whether anything was emitted.
    async fn set_state(&mut self, idx: usize, new_state: DownloadState) -> bool {
        if self.downloads[idx].state == new_state {
            return false;
        }
        self.downloads[idx].state = new_state;
        self.publish(idx).await;
        true
    }

    /// Publish the download's current record: commit it to the index, notify
    /// listeners, and drop the download once a terminal state is out.
    async fn publish(&mut self, idx: usize) {
        let record = self.downloads[idx].updated_record(now_ms());
        tracing::debug!(id = %record.id, state = %record.state, "download state published");
        if record.state == DownloadState::Removed {
            if let Err(error) = self.index.delete(&record.id).await {
                tracing::error!(%error, id = %record.id, "deleting download record failed");
            }
        } else if let Err(error) = self.index.put(&record).await {
            tracing::error!(%error, id = %record.id, "persisting download record failed");
        }
        let terminal = record.state.is_terminal();
        let _ = self
            .notifications
            .send(Notification::DownloadChanged(record));
        if terminal {
            self.downloads.remove(idx);
        }
    }

    // --- Worker admission ---

    fn start_worker(&mut self, idx: usize) -> StartWorker {
        let id = self.downloads[idx].id().to_owned();
        if let Some(active) = self.active.get_mut(&id) {
            if active.is_remove {
                return StartWorker::WaitRemovalToFinish;
            }
            active.cancel();
            tracing::debug!(id = %id, "fetch worker cancelled");
            return StartWorker::WaitDownloadCancellation;
        }

        let is_remove = self.downloads[idx].is_in_remove_state();
        if !is_remove {
            if self.simultaneous_downloads == self.max_simultaneous_downloads {
                return StartWorker::TooManyDownloads;
            }
            self.simultaneous_downloads += 1;
        }

        let downloader = self.downloader_factory.create(&self.downloads[idx].request());
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let cancel = CancellationToken::new();
        worker::spawn(
            id.clone(),
            worker_id,
            Arc::clone(&downloader),
            is_remove,
            self.min_retry_count,
            cancel.clone(),
            self.completions.clone(),
        );
        self.downloads[idx].counters = Some(downloader.counters());
        self.active.insert(
            id,
            ActiveWorker {
                worker_id,
                is_remove,
                is_canceled: false,
                cancel,
                downloader,
            },
        );
        StartWorker::Succeeded
    }

    /// Cancel the fetch worker bound to `id`, if one is running. Removal
    /// workers are never preempted.
    fn stop_worker(&mut self, id: &str) {
        if let Some(active) = self.active.get_mut(id) {
            if !active.is_remove {
                active.cancel();
                tracing::debug!(id, "fetch worker cancelled");
            }
        }
    }

    // --- Helpers ---

    async fn insert_download(&mut self, record: DownloadRecord) {
        let download = Download::new(record, self.not_met_requirements, self.manual_stop_reason);
        tracing::debug!(id = %download.id(), state = %download.state, "download added");
        self.downloads.push(download);
        let idx = self.downloads.len() - 1;
        let initial_state = self.downloads[idx].state;
        self.initialize(idx, initial_state).await;
    }

    fn find_download(&self, id: &str) -> Option<usize> {
        self.downloads.iter().position(|d| d.id() == id)
    }

    async fn load_record(&self, id: &str) -> Option<DownloadRecord> {
        match self.index.get(id).await {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(%error, id, "loading download record failed");
                None
            }
        }
    }

    fn check_idle(&self) {
        let _ = self
            .notifications
            .send(Notification::IdleChanged(self.active.is_empty()));
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(0)
}

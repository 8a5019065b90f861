//! Download manager: public controller and listener dispatch.
//!
//! # Concurrency model
//!
//! - **Scheduler task** — owns the download collection, the active worker
//!   table, the fetch-slot count, and every index write. All mutations flow
//!   through its message channel in FIFO order (see [`scheduler`]).
//! - **Dispatch task** — owns the state snapshot map and the listener set;
//!   delivers callbacks in posted order. `on_idle` fires on the rising edge
//!   only.
//! - **Worker tasks** — at most `max_simultaneous_downloads` fetch workers
//!   plus any number of removal workers (teardown must never starve behind
//!   pending fetches). Each posts a single completion message.
//!
//! The controller itself is thin: public calls post messages and read the
//! dispatch task's snapshot.

mod download;
mod scheduler;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use offcast_core::download::{
    DownloadManagerListener, DownloadRecord, DownloadRequest, STOP_REASON_NONE,
    STOP_REASON_UNDEFINED,
};
use offcast_core::ports::{DownloadIndex, DownloaderFactory, RequirementsWatcher};
use offcast_core::requirements::{RequirementFlags, Requirements};

use self::scheduler::{Message, Scheduler};

/// Configuration for the download manager.
#[derive(Clone, Debug)]
pub struct DownloadManagerConfig {
    /// Maximum number of simultaneous fetch workers. Removal workers are not
    /// counted.
    pub max_simultaneous_downloads: usize,
    /// Number of times a fetch is retried without byte progress before it
    /// fails.
    pub min_retry_count: u32,
    /// Preconditions that must be met before fetches may run.
    pub requirements: Requirements,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_downloads: 1,
            min_retry_count: 5,
            requirements: Requirements::default(),
        }
    }
}

/// Notifications flowing to the dispatch task, delivered in posted order.
pub(crate) enum Notification {
    Initialized,
    DownloadChanged(DownloadRecord),
    IdleChanged(bool),
    RequirementsChanged {
        requirements: Requirements,
        not_met: RequirementFlags,
    },
    /// Acknowledge `release()` after everything queued ahead has been
    /// delivered, then stop dispatching.
    Shutdown(oneshot::Sender<()>),
}

/// Snapshot state owned by the dispatch task, readable by accessors.
#[derive(Default)]
struct ObserverState {
    download_states: Mutex<HashMap<String, DownloadRecord>>,
    idle: AtomicBool,
    initialized: AtomicBool,
}

/// Copy-on-read listener set: callbacks run on a snapshot, so listeners may
/// add or remove listeners from inside a callback.
#[derive(Default)]
struct Listeners {
    entries: Mutex<Vec<Arc<dyn DownloadManagerListener>>>,
}

impl Listeners {
    fn add(&self, listener: Arc<dyn DownloadManagerListener>) {
        self.entries.lock().unwrap().push(listener);
    }

    fn remove(&self, listener: &Arc<dyn DownloadManagerListener>) {
        let target = Arc::as_ptr(listener).cast::<()>();
        self.entries
            .lock()
            .unwrap()
            .retain(|entry| Arc::as_ptr(entry).cast::<()>() != target);
    }

    fn snapshot(&self) -> Vec<Arc<dyn DownloadManagerListener>> {
        self.entries.lock().unwrap().clone()
    }
}

struct WatcherState {
    requirements: Requirements,
    forwarder: Option<JoinHandle<()>>,
}

/// Persistent download manager.
///
/// Construct it inside a tokio runtime; it spawns its scheduler and dispatch
/// tasks immediately and begins restoring persisted downloads. Call
/// [`release`](Self::release) when done — the manager must not be used
/// afterwards.
pub struct DownloadManager {
    index: Arc<dyn DownloadIndex>,
    watcher: Arc<dyn RequirementsWatcher>,
    to_scheduler: mpsc::UnboundedSender<Message>,
    notifications: mpsc::UnboundedSender<Notification>,
    observer: Arc<ObserverState>,
    listeners: Arc<Listeners>,
    watcher_state: Mutex<WatcherState>,
    released: AtomicBool,
}

impl DownloadManager {
    /// Create a manager and start restoring persisted downloads.
    ///
    /// Records found in a non-terminal state are re-driven through the state
    /// machine: eligible ones take a fetch slot or park queued, stopped ones
    /// re-publish their state for bootstrapping listeners, and half-finished
    /// removals resume deleting.
    #[must_use]
    pub fn new(
        index: Arc<dyn DownloadIndex>,
        downloader_factory: Arc<dyn DownloaderFactory>,
        watcher: Arc<dyn RequirementsWatcher>,
        config: DownloadManagerConfig,
    ) -> Self {
        let (to_scheduler, scheduler_rx) = mpsc::unbounded_channel();
        let (notifications, notifications_rx) = mpsc::unbounded_channel();

        let observer = Arc::new(ObserverState::default());
        let listeners = Arc::new(Listeners::default());
        tokio::spawn(dispatch_loop(
            notifications_rx,
            Arc::clone(&observer),
            Arc::clone(&listeners),
        ));

        let (initial_not_met, updates) = watcher.start(config.requirements);
        let forwarder = tokio::spawn(forward_requirement_updates(
            updates,
            config.requirements,
            to_scheduler.clone(),
            notifications.clone(),
        ));

        let scheduler = Scheduler::new(
            Arc::clone(&index),
            downloader_factory,
            &config,
            initial_not_met,
            to_scheduler.clone(),
            notifications.clone(),
        );
        tokio::spawn(scheduler.run(scheduler_rx));

        tracing::debug!(
            max_simultaneous_downloads = config.max_simultaneous_downloads,
            min_retry_count = config.min_retry_count,
            "download manager created"
        );
        Self {
            index,
            watcher,
            to_scheduler,
            notifications,
            observer,
            listeners,
            watcher_state: Mutex::new(WatcherState {
                requirements: config.requirements,
                forwarder: Some(forwarder),
            }),
            released: AtomicBool::new(false),
        }
    }

    /// Add a download, or merge the request into the existing one with the
    /// same id.
    pub fn add_download(&self, request: DownloadRequest) {
        self.post(Message::Add(request));
    }

    /// Cancel the download with `id` and delete its cached bytes.
    pub fn remove_download(&self, id: &str) {
        self.post(Message::Remove(id.to_owned()));
    }

    /// Clear the manual stop reason of all downloads; they start again if
    /// the requirements are met.
    pub fn start_downloads(&self) {
        self.post(Message::SetStopReason {
            id: None,
            reason: STOP_REASON_NONE,
        });
    }

    /// Stop all downloads without a specific reason.
    pub fn stop_downloads(&self) {
        self.stop_downloads_with_reason(STOP_REASON_UNDEFINED);
    }

    /// Stop all downloads with an application-defined reason.
    ///
    /// # Panics
    ///
    /// Panics if `reason` is [`STOP_REASON_NONE`]; use
    /// [`start_downloads`](Self::start_downloads) to resume.
    pub fn stop_downloads_with_reason(&self, reason: u32) {
        assert_ne!(reason, STOP_REASON_NONE, "stop reason must not be NONE");
        self.post(Message::SetStopReason { id: None, reason });
    }

    /// Clear the manual stop reason of one download.
    pub fn start_download(&self, id: &str) {
        self.post(Message::SetStopReason {
            id: Some(id.to_owned()),
            reason: STOP_REASON_NONE,
        });
    }

    /// Stop one download without a specific reason.
    pub fn stop_download(&self, id: &str) {
        self.stop_download_with_reason(id, STOP_REASON_UNDEFINED);
    }

    /// Stop one download with an application-defined reason.
    ///
    /// # Panics
    ///
    /// Panics if `reason` is [`STOP_REASON_NONE`]; use
    /// [`start_download`](Self::start_download) to resume.
    pub fn stop_download_with_reason(&self, id: &str, reason: u32) {
        assert_ne!(reason, STOP_REASON_NONE, "stop reason must not be NONE");
        self.post(Message::SetStopReason {
            id: Some(id.to_owned()),
            reason,
        });
    }

    /// Replace the requirements, restarting the watcher. A no-op when the
    /// requirements are unchanged.
    pub fn set_requirements(&self, requirements: Requirements) {
        self.assert_not_released();
        let mut state = self.watcher_state.lock().unwrap();
        if state.requirements == requirements {
            return;
        }
        self.watcher.stop();
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.abort();
        }
        let (not_met, updates) = self.watcher.start(requirements);
        state.requirements = requirements;
        state.forwarder = Some(tokio::spawn(forward_requirement_updates(
            updates,
            requirements,
            self.to_scheduler.clone(),
            self.notifications.clone(),
        )));
        let _ = self.notifications.send(Notification::RequirementsChanged {
            requirements,
            not_met,
        });
        let _ = self
            .to_scheduler
            .send(Message::SetNotMetRequirements(not_met));
    }

    /// The requirements currently being watched.
    pub fn requirements(&self) -> Requirements {
        self.assert_not_released();
        self.watcher_state.lock().unwrap().requirements
    }

    /// Number of non-terminal downloads observed so far.
    pub fn download_count(&self) -> usize {
        self.assert_not_released();
        self.observer.download_states.lock().unwrap().len()
    }

    /// Snapshot of every non-terminal download's last published record.
    pub fn all_download_states(&self) -> Vec<DownloadRecord> {
        self.assert_not_released();
        self.observer
            .download_states
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Whether no worker is active.
    pub fn is_idle(&self) -> bool {
        self.assert_not_released();
        self.observer.idle.load(Ordering::SeqCst)
    }

    /// Whether persisted downloads have been restored.
    pub fn is_initialized(&self) -> bool {
        self.assert_not_released();
        self.observer.initialized.load(Ordering::SeqCst)
    }

    /// The download index backing this manager.
    pub fn download_index(&self) -> Arc<dyn DownloadIndex> {
        self.assert_not_released();
        Arc::clone(&self.index)
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn DownloadManagerListener>) {
        self.assert_not_released();
        self.listeners.add(listener);
    }

    /// Unregister a listener previously passed to
    /// [`add_listener`](Self::add_listener).
    pub fn remove_listener(&self, listener: &Arc<dyn DownloadManagerListener>) {
        self.assert_not_released();
        self.listeners.remove(listener);
    }

    /// Stop all workers and shut down. Idempotent. Resolves once queued work
    /// has drained; no listener is called after that. The manager must not
    /// be used afterwards.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watcher.stop();
        if let Some(forwarder) = self.watcher_state.lock().unwrap().forwarder.take() {
            forwarder.abort();
        }
        let (ack, done) = oneshot::channel();
        if self.to_scheduler.send(Message::Release(ack)).is_ok() {
            let _ = done.await;
        }
        tracing::debug!("download manager released");
    }

    fn post(&self, message: Message) {
        self.assert_not_released();
        let _ = self.to_scheduler.send(message);
    }

    fn assert_not_released(&self) {
        assert!(
            !self.released.load(Ordering::SeqCst),
            "download manager used after release"
        );
    }
}

/// Deliver notifications to listeners, maintaining the snapshot state.
async fn dispatch_loop(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    observer: Arc<ObserverState>,
    listeners: Arc<Listeners>,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Initialized => {
                observer.initialized.store(true, Ordering::SeqCst);
                for listener in listeners.snapshot() {
                    listener.on_initialized();
                }
            }
            Notification::DownloadChanged(record) => {
                {
                    let mut states = observer.download_states.lock().unwrap();
                    if record.state.is_terminal() {
                        states.remove(&record.id);
                    } else {
                        states.insert(record.id.clone(), record.clone());
                    }
                }
                for listener in listeners.snapshot() {
                    listener.on_download_changed(&record);
                }
            }
            Notification::IdleChanged(idle) => {
                let was_idle = observer.idle.swap(idle, Ordering::SeqCst);
                if idle && !was_idle {
                    for listener in listeners.snapshot() {
                        listener.on_idle();
                    }
                }
            }
            Notification::RequirementsChanged {
                requirements,
                not_met,
            } => {
                for listener in listeners.snapshot() {
                    listener.on_requirements_changed(&requirements, not_met);
                }
            }
            Notification::Shutdown(ack) => {
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// Forward watcher updates into the scheduler and to listeners.
async fn forward_requirement_updates(
    mut updates: watch::Receiver<RequirementFlags>,
    requirements: Requirements,
    to_scheduler: mpsc::UnboundedSender<Message>,
    notifications: mpsc::UnboundedSender<Notification>,
) {
    while updates.changed().await.is_ok() {
        let not_met = *updates.borrow_and_update();
        tracing::debug!(not_met, "requirements state changed");
        let _ = notifications.send(Notification::RequirementsChanged {
            requirements,
            not_met,
        });
        if to_scheduler
            .send(Message::SetNotMetRequirements(not_met))
            .is_err()
        {
            return;
        }
    }
}

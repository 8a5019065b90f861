//! Port definitions (trait abstractions) for external systems.
//!
//! Ports define the interfaces the manager expects from its collaborators:
//! the byte-level downloader, the durable index, and the requirements
//! watcher. They use only domain types; implementations live elsewhere
//! (`offcast-db` for SQLite, the embedding application for transfer and
//! OS condition watching). In-memory implementations ship next to the
//! traits for tests and simple embedders.

mod downloader;
mod index;
mod watcher;

pub use downloader::{Downloader, DownloaderFactory, TransferCounters};
pub use index::{DownloadIndex, InMemoryDownloadIndex};
pub use watcher::{ManualRequirementsWatcher, RequirementsWatcher};

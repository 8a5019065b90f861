//! SQLite implementation of the offcast download index.
//!
//! The schema is an implementation detail: records round-trip through
//! [`SqliteDownloadIndex`], nothing else should touch the table.

mod index;

pub use index::{setup_download_index, SqliteDownloadIndex};

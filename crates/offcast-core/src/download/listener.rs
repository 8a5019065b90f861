//! Listener trait for manager events.

use crate::requirements::{RequirementFlags, Requirements};

use super::record::DownloadRecord;

/// Listener for download manager events.
///
/// All methods default to no-ops so implementors only override what they
/// need. Callbacks run on the manager's dispatch task in the order the
/// events were posted; adding or removing listeners from inside a callback
/// is safe.
pub trait DownloadManagerListener: Send + Sync {
    /// Called once every persisted download has been restored.
    fn on_initialized(&self) {}

    /// Called when the observable state of one download changes. The record
    /// is the same snapshot that was committed to the index.
    fn on_download_changed(&self, _record: &DownloadRecord) {}

    /// Called when the last active worker stops.
    fn on_idle(&self) {}

    /// Called when the requirements, or the set of requirements that are not
    /// met, change.
    fn on_requirements_changed(&self, _requirements: &Requirements, _not_met: RequirementFlags) {}
}

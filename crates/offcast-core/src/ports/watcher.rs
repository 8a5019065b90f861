//! Requirements watcher port.

use std::sync::Mutex;

use tokio::sync::watch;

use crate::requirements::{DeviceState, RequirementFlags, Requirements};

/// Observes environment preconditions for the manager.
///
/// `start` evaluates the given requirements immediately and returns the
/// currently not-met flags together with a channel of subsequent updates.
/// The manager stops and restarts the watcher whenever its requirements
/// change, so an implementation only ever watches one requirement set at a
/// time.
pub trait RequirementsWatcher: Send + Sync {
    /// Begin watching `requirements`. Returns the flags that are not met
    /// right now and a receiver of future flag changes.
    fn start(
        &self,
        requirements: Requirements,
    ) -> (RequirementFlags, watch::Receiver<RequirementFlags>);

    /// Stop delivering updates.
    fn stop(&self);
}

struct ManualWatcherState {
    device: DeviceState,
    requirements: Requirements,
    sender: Option<watch::Sender<RequirementFlags>>,
}

/// A watcher driven by explicit [`set_device_state`] calls.
///
/// Useful in tests and on hosts without OS-level condition callbacks: the
/// embedder observes conditions however it likes and pushes them in.
///
/// [`set_device_state`]: ManualRequirementsWatcher::set_device_state
pub struct ManualRequirementsWatcher {
    state: Mutex<ManualWatcherState>,
}

impl ManualRequirementsWatcher {
    /// Create a watcher with an initial device state.
    #[must_use]
    pub fn new(device: DeviceState) -> Self {
        Self {
            state: Mutex::new(ManualWatcherState {
                device,
                requirements: Requirements::default(),
                sender: None,
            }),
        }
    }

    /// Update the device state, notifying the active watch.
    pub fn set_device_state(&self, device: DeviceState) {
        let mut state = self.state.lock().unwrap();
        state.device = device;
        if let Some(sender) = &state.sender {
            let _ = sender.send(state.requirements.not_met(&device));
        }
    }
}

impl RequirementsWatcher for ManualRequirementsWatcher {
    fn start(
        &self,
        requirements: Requirements,
    ) -> (RequirementFlags, watch::Receiver<RequirementFlags>) {
        let mut state = self.state.lock().unwrap();
        state.requirements = requirements;
        let flags = requirements.not_met(&state.device);
        let (sender, receiver) = watch::channel(flags);
        state.sender = Some(sender);
        (flags, receiver)
    }

    fn stop(&self) {
        self.state.lock().unwrap().sender = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::REQUIREMENT_NETWORK;

    #[tokio::test]
    async fn start_reports_current_flags_and_pushes_updates() {
        let watcher = ManualRequirementsWatcher::new(DeviceState::default());
        let (flags, mut updates) = watcher.start(Requirements::default());
        assert_eq!(flags, REQUIREMENT_NETWORK);

        watcher.set_device_state(DeviceState::connected());
        updates.changed().await.unwrap();
        assert_eq!(*updates.borrow(), 0);
    }

    #[test]
    fn stop_drops_the_channel() {
        let watcher = ManualRequirementsWatcher::new(DeviceState::connected());
        let (flags, updates) = watcher.start(Requirements::default());
        assert_eq!(flags, 0);

        watcher.stop();
        // Updates after stop go nowhere and must not panic.
        watcher.set_device_state(DeviceState::default());
        assert!(updates.has_changed().is_err());
    }
}

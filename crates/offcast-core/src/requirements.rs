//! Download preconditions and their not-met flags.

use serde::{Deserialize, Serialize};

/// Bitmask of requirements that are currently not satisfied. Zero means
/// downloads may run.
pub type RequirementFlags = u32;

/// Network connectivity is required but absent.
pub const REQUIREMENT_NETWORK: RequirementFlags = 1;
/// An unmetered network is required but the active network is metered.
pub const REQUIREMENT_NETWORK_UNMETERED: RequirementFlags = 1 << 1;
/// The device must be charging.
pub const REQUIREMENT_CHARGING: RequirementFlags = 1 << 2;
/// The device must be idle.
pub const REQUIREMENT_DEVICE_IDLE: RequirementFlags = 1 << 3;

/// Network condition downloads need before they may run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    /// No network needed.
    None,
    /// Any network connection.
    #[default]
    Any,
    /// An unmetered network connection.
    Unmetered,
}

/// Environment preconditions that must hold for downloads to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Required network condition.
    pub network: NetworkRequirement,
    /// Whether the device must be charging.
    pub charging: bool,
    /// Whether the device must be idle.
    pub device_idle: bool,
}

impl Requirements {
    /// Flags for every requirement `device` currently fails to satisfy.
    #[must_use]
    pub fn not_met(&self, device: &DeviceState) -> RequirementFlags {
        let mut flags = 0;
        match self.network {
            NetworkRequirement::None => {}
            NetworkRequirement::Any => {
                if !device.network_connected {
                    flags |= REQUIREMENT_NETWORK;
                }
            }
            NetworkRequirement::Unmetered => {
                if !device.network_connected {
                    flags |= REQUIREMENT_NETWORK;
                } else if !device.network_unmetered {
                    flags |= REQUIREMENT_NETWORK_UNMETERED;
                }
            }
        }
        if self.charging && !device.charging {
            flags |= REQUIREMENT_CHARGING;
        }
        if self.device_idle && !device.device_idle {
            flags |= REQUIREMENT_DEVICE_IDLE;
        }
        flags
    }
}

/// Snapshot of the device conditions a watcher evaluates requirements
/// against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// A network is connected.
    pub network_connected: bool,
    /// The connected network is unmetered.
    pub network_unmetered: bool,
    /// The device is charging.
    pub charging: bool,
    /// The device is idle.
    pub device_idle: bool,
}

impl DeviceState {
    /// A device on an unmetered connection, neither charging nor idle.
    #[must_use]
    pub const fn connected() -> Self {
        Self {
            network_connected: true,
            network_unmetered: true,
            charging: false,
            device_idle: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_requirements_need_any_network() {
        let requirements = Requirements::default();
        assert_eq!(requirements.not_met(&DeviceState::connected()), 0);
        assert_eq!(
            requirements.not_met(&DeviceState::default()),
            REQUIREMENT_NETWORK
        );
    }

    #[test]
    fn unmetered_requirement_distinguishes_absent_and_metered() {
        let requirements = Requirements {
            network: NetworkRequirement::Unmetered,
            ..Requirements::default()
        };

        assert_eq!(
            requirements.not_met(&DeviceState::default()),
            REQUIREMENT_NETWORK
        );

        let metered = DeviceState {
            network_connected: true,
            network_unmetered: false,
            ..DeviceState::default()
        };
        assert_eq!(
            requirements.not_met(&metered),
            REQUIREMENT_NETWORK_UNMETERED
        );

        assert_eq!(requirements.not_met(&DeviceState::connected()), 0);
    }

    #[test]
    fn charging_and_idle_flags_combine() {
        let requirements = Requirements {
            network: NetworkRequirement::None,
            charging: true,
            device_idle: true,
        };
        assert_eq!(
            requirements.not_met(&DeviceState::default()),
            REQUIREMENT_CHARGING | REQUIREMENT_DEVICE_IDLE
        );

        let charging = DeviceState {
            charging: true,
            ..DeviceState::default()
        };
        assert_eq!(requirements.not_met(&charging), REQUIREMENT_DEVICE_IDLE);
    }
}

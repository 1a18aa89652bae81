//! Device mode classification.
//!
//! The mode of an attached device is a pure function of its USB
//! vendor/product id pair.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::constants::{APPLE_VENDOR_ID, DFU_MODE_PID, RECOVERY_MODE_PID, WTF_MODE_PID};

/// Bootloader state of an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMode {
    /// Booted OS, reachable through the normal-mode provider.
    Normal,
    /// iBoot recovery (cable/computer icon on screen).
    Recovery,
    /// Boot ROM DFU (blank screen).
    Dfu,
    /// "What The Flash" low-level restore mode.
    Wtf,
    /// Anything we do not recognise.
    Unknown,
}

impl DeviceMode {
    /// Classify a device by its USB identifiers.
    ///
    /// Only the Apple vendor id with one of the three bootloader product ids
    /// yields a bootloader mode; every other pair is `Unknown`. Normal-mode
    /// devices are reported by the normal-mode provider, never by USB id.
    pub const fn classify(vendor_id: u16, product_id: u16) -> Self {
        if vendor_id != APPLE_VENDOR_ID {
            return DeviceMode::Unknown;
        }
        match product_id {
            RECOVERY_MODE_PID => DeviceMode::Recovery,
            DFU_MODE_PID => DeviceMode::Dfu,
            WTF_MODE_PID => DeviceMode::Wtf,
            _ => DeviceMode::Unknown,
        }
    }

    /// Whether this mode belongs in recovery device listings.
    pub fn is_bootloader(&self) -> bool {
        matches!(self, DeviceMode::Recovery | DeviceMode::Dfu | DeviceMode::Wtf)
    }

    /// Whether the in-process iRecovery client can talk to this mode.
    pub fn accepts_session(&self) -> bool {
        matches!(self, DeviceMode::Recovery | DeviceMode::Dfu)
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Normal => write!(f, "Normal Mode"),
            DeviceMode::Recovery => write!(f, "Recovery Mode"),
            DeviceMode::Dfu => write!(f, "DFU Mode"),
            DeviceMode::Wtf => write!(f, "WTF Mode"),
            DeviceMode::Unknown => write!(f, "Unknown Mode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_product_ids() {
        assert_eq!(DeviceMode::classify(0x05AC, 0x1281), DeviceMode::Recovery);
        assert_eq!(DeviceMode::classify(0x05AC, 0x1227), DeviceMode::Dfu);
        assert_eq!(DeviceMode::classify(0x05AC, 0x1222), DeviceMode::Wtf);
    }

    #[test]
    fn test_unknown_apple_product() {
        // 0x12A8 is a normal-mode iPhone; USB id alone never says "Normal"
        assert_eq!(DeviceMode::classify(0x05AC, 0x12A8), DeviceMode::Unknown);
        assert!(!DeviceMode::Unknown.is_bootloader());
    }

    #[test]
    fn test_wtf_is_listed_but_not_opened() {
        assert!(DeviceMode::Wtf.is_bootloader());
        assert!(!DeviceMode::Wtf.accepts_session());
        assert!(DeviceMode::Dfu.accepts_session());
    }

    proptest! {
        #[test]
        fn classify_is_total_and_pure(vid in any::<u16>(), pid in any::<u16>()) {
            let first = DeviceMode::classify(vid, pid);
            prop_assert_eq!(first, DeviceMode::classify(vid, pid));

            let expected = match (vid, pid) {
                (0x05AC, 0x1281) => DeviceMode::Recovery,
                (0x05AC, 0x1227) => DeviceMode::Dfu,
                (0x05AC, 0x1222) => DeviceMode::Wtf,
                _ => DeviceMode::Unknown,
            };
            prop_assert_eq!(first, expected);
        }
    }
}

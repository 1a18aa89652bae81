//! Normal-mode device information provider.
//!
//! The core only needs three operations from whatever talks to a booted
//! device; pairing and the lockdown protocol live behind this boundary.

use crate::cancel::CancelToken;
use crate::tools::RecoveryIdentity;

/// Narrow contract for devices booted into the OS.
///
/// Every call takes the caller's [`CancelToken`]; implementations that
/// spawn processes must stop them when it fires.
pub trait NormalModeProvider: Send + Sync {
    /// UDIDs of attached, booted devices.
    fn list_devices(&self, cancel: &CancelToken) -> Vec<String>;

    /// One lockdown value, e.g. `ProductType` or `UniqueChipID`.
    fn get_value(&self, udid: &str, key: &str, cancel: &CancelToken) -> Option<String>;

    /// Ask the device to reboot into recovery mode.
    fn enter_recovery(&self, udid: &str, cancel: &CancelToken) -> bool;
}

/// Provider used when no normal-mode tooling is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNormalMode;

impl NormalModeProvider for NoNormalMode {
    fn list_devices(&self, _cancel: &CancelToken) -> Vec<String> {
        Vec::new()
    }

    fn get_value(&self, _udid: &str, _key: &str, _cancel: &CancelToken) -> Option<String> {
        None
    }

    fn enter_recovery(&self, _udid: &str, _cancel: &CancelToken) -> bool {
        false
    }
}

/// Identifiers used by signing and bundle selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub udid: Option<String>,
    pub product_type: Option<String>,
    pub ecid: Option<String>,
    pub chip_id: Option<String>,
    pub board_id: Option<String>,
}

impl DeviceIdentity {
    /// Read the identity of a booted device.
    pub fn from_normal_mode(
        provider: &dyn NormalModeProvider,
        udid: &str,
        cancel: &CancelToken,
    ) -> Self {
        let value = |key: &str| provider.get_value(udid, key, cancel);
        Self {
            udid: Some(udid.to_string()),
            product_type: value("ProductType"),
            ecid: value("UniqueChipID"),
            chip_id: value("ChipID"),
            board_id: value("BoardId"),
        }
    }

    /// Fill gaps from another source without overwriting known values.
    pub fn merge(&mut self, other: DeviceIdentity) {
        self.udid = self.udid.take().or(other.udid);
        self.product_type = self.product_type.take().or(other.product_type);
        self.ecid = self.ecid.take().or(other.ecid);
        self.chip_id = self.chip_id.take().or(other.chip_id);
        self.board_id = self.board_id.take().or(other.board_id);
    }
}

impl From<RecoveryIdentity> for DeviceIdentity {
    fn from(id: RecoveryIdentity) -> Self {
        Self {
            udid: None,
            product_type: id.product_type,
            ecid: id.ecid,
            chip_id: id.chip_id,
            board_id: id.board_id,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory provider with a fixed device table.
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub values: HashMap<(String, String), String>,
        pub accepts_recovery: bool,
        pub recovery_requests: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        pub(crate) fn with_device(udid: &str, product: &str) -> Self {
            let mut values = HashMap::new();
            values.insert((udid.into(), "ProductType".into()), product.into());
            values.insert((udid.into(), "UniqueChipID".into()), "6008090422530094".into());
            Self {
                values,
                accepts_recovery: true,
                ..Default::default()
            }
        }
    }

    impl NormalModeProvider for FakeProvider {
        fn list_devices(&self, _cancel: &CancelToken) -> Vec<String> {
            let mut udids: Vec<String> = self.values.keys().map(|(u, _)| u.clone()).collect();
            udids.sort();
            udids.dedup();
            udids
        }

        fn get_value(&self, udid: &str, key: &str, _cancel: &CancelToken) -> Option<String> {
            self.values.get(&(udid.to_string(), key.to_string())).cloned()
        }

        fn enter_recovery(&self, udid: &str, _cancel: &CancelToken) -> bool {
            self.recovery_requests.lock().unwrap().push(udid.to_string());
            self.accepts_recovery
        }
    }

    #[test]
    fn test_identity_from_provider() {
        let provider = FakeProvider::with_device("abc", "iPhone12,1");
        let identity = DeviceIdentity::from_normal_mode(&provider, "abc", &CancelToken::new());
        assert_eq!(identity.product_type.as_deref(), Some("iPhone12,1"));
        assert_eq!(identity.ecid.as_deref(), Some("6008090422530094"));
        assert_eq!(identity.chip_id, None);
    }

    #[test]
    fn test_merge_keeps_known_values() {
        let mut identity = DeviceIdentity {
            product_type: Some("iPhone12,1".into()),
            ..Default::default()
        };
        identity.merge(DeviceIdentity {
            product_type: Some("iPad7,5".into()),
            ecid: Some("0x1234".into()),
            ..Default::default()
        });
        assert_eq!(identity.product_type.as_deref(), Some("iPhone12,1"));
        assert_eq!(identity.ecid.as_deref(), Some("0x1234"));
    }

    #[test]
    fn test_no_normal_mode_is_empty() {
        let provider = NoNormalMode;
        let cancel = CancelToken::new();
        assert!(provider.list_devices(&cancel).is_empty());
        assert!(!provider.enter_recovery("abc", &cancel));
    }
}

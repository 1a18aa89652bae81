//! Vendor device-support service boundary.
//!
//! Where a vendor recovery service is installed it exposes the attached
//! recovery device and two calls on it. Arrival is observed by polling
//! [`NativeRecoveryApi::recovery_device`], so callers hold no callbacks.

use anyhow::bail;

/// Opaque handle to a recovery-mode device known to the vendor service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDevice {
    pub id: String,
}

pub trait NativeRecoveryApi: Send + Sync {
    /// Whether the service is installed and loaded.
    fn is_available(&self) -> bool;

    /// The recovery-mode device currently attached, if any.
    fn recovery_device(&self) -> Option<NativeDevice>;

    fn set_auto_boot(&self, device: &NativeDevice, enabled: bool) -> anyhow::Result<()>;

    fn reboot(&self, device: &NativeDevice) -> anyhow::Result<()>;
}

/// Used on platforms without the vendor service.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableNativeApi;

impl NativeRecoveryApi for UnavailableNativeApi {
    fn is_available(&self) -> bool {
        false
    }

    fn recovery_device(&self) -> Option<NativeDevice> {
        None
    }

    fn set_auto_boot(&self, _device: &NativeDevice, _enabled: bool) -> anyhow::Result<()> {
        bail!("vendor device service not installed")
    }

    fn reboot(&self, _device: &NativeDevice) -> anyhow::Result<()> {
        bail!("vendor device service not installed")
    }
}

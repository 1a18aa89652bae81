//! USB device enumeration and mode classification.
//!
//! Every call is a fresh, finite enumeration pass; descriptors are never
//! cached or mutated. A device is identified by its bus path.

use std::fmt;

use tracing::{debug, warn};

use crate::protocol::DeviceMode;
use crate::transport::{TransportError, UsbBus, UsbDeviceRecord};

/// One attached USB device, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub bus_path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub mode: DeviceMode,
}

impl DeviceDescriptor {
    pub fn from_record(record: UsbDeviceRecord) -> Self {
        let mode = DeviceMode::classify(record.vendor_id, record.product_id);
        Self {
            name: record.name,
            bus_path: record.bus_path,
            vendor_id: record.vendor_id,
            product_id: record.product_id,
            mode,
        }
    }

    /// Back to the raw record, for reopening through the bus.
    pub fn record(&self) -> UsbDeviceRecord {
        UsbDeviceRecord {
            name: self.name.clone(),
            bus_path: self.bus_path.clone(),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] VID:{:04X} PID:{:04X} ({})",
            self.name, self.bus_path, self.vendor_id, self.product_id, self.mode
        )
    }
}

/// List every attached device, in bus order.
///
/// Devices that fail to enumerate are logged and skipped.
pub fn list_devices(bus: &dyn UsbBus) -> Result<Vec<DeviceDescriptor>, TransportError> {
    let entries = bus.scan()?;
    let mut devices = Vec::with_capacity(entries.len());

    for entry in entries {
        match entry {
            Ok(record) => devices.push(DeviceDescriptor::from_record(record)),
            Err(e) => debug!(error = %e, "Skipping device that failed to enumerate"),
        }
    }

    Ok(devices)
}

/// Devices currently in Recovery, DFU or WTF mode.
///
/// A failed platform query is reported as "no devices" so that polling
/// loops keep polling.
pub fn find_recovery_devices(bus: &dyn UsbBus) -> Vec<DeviceDescriptor> {
    match list_devices(bus) {
        Ok(devices) => devices
            .into_iter()
            .filter(|d| d.mode.is_bootloader())
            .collect(),
        Err(e) => {
            warn!(error = %e, "Error detecting recovery devices");
            Vec::new()
        }
    }
}

/// First device in Recovery or DFU mode, the modes a protocol session can
/// be opened on. WTF devices are listed but skipped here.
pub fn find_session_device(bus: &dyn UsbBus) -> Option<DeviceDescriptor> {
    find_recovery_devices(bus)
        .into_iter()
        .find(|d| d.mode.accepts_session())
}

/// Quick check if any recovery-mode device is connected.
pub fn is_recovery_mode_available(bus: &dyn UsbBus) -> bool {
    !find_recovery_devices(bus).is_empty()
}

//! USB Transport layer abstraction.
//!
//! Defines the `UsbBus` trait (enumeration + open) and the `RecoveryTransport`
//! trait (one opened device handle), allowing different implementations
//! (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No recovery/DFU device found")]
    NoDeviceFound,

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to set configuration {config}: {message}")]
    ConfigurationFailed { config: u8, message: String },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimFailed { interface: u8, message: String },

    #[error("Endpoint 0x{address:02X} unavailable: {message}")]
    EndpointUnavailable { address: u8, message: String },

    #[error("Timeout after {timeout_ms}ms")]
    TransferTimeout { timeout_ms: u64 },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Failed to enumerate device: {0}")]
    EnumerationFailed(String),

    #[error("Device {bus_path} already has an open session")]
    DeviceBusy { bus_path: String },

    #[error("Session is no longer valid (device rebooted)")]
    SessionInvalidated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Soft failures downgrade the session instead of aborting it.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            TransportError::ConfigurationFailed { .. } | TransportError::ClaimFailed { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::TransferTimeout { .. })
    }
}

/// Raw USB device record as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceRecord {
    pub name: String,
    pub bus_path: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Endpoint opened on a claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: usize,
}

/// Setup packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Read-only view of the USB bus.
pub trait UsbBus: Send + Sync {
    /// One finite enumeration pass.
    ///
    /// The outer error means the platform query itself failed; inner errors
    /// are individual devices that could not be described and are skipped
    /// by callers.
    fn scan(&self) -> Result<Vec<Result<UsbDeviceRecord, TransportError>>, TransportError>;

    /// Open an exclusive handle on the device at `record.bus_path`.
    fn open(&self, record: &UsbDeviceRecord) -> Result<Box<dyn RecoveryTransport>, TransportError>;
}

/// An opened USB device handle.
///
/// Every step is independently fallible so callers can decide which
/// failures are soft.
pub trait RecoveryTransport: Send {
    /// Select a USB configuration.
    fn set_configuration(&mut self, config: u8) -> Result<(), TransportError>;

    /// Claim an interface for exclusive use.
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Open a bulk endpoint on the claimed interface.
    fn open_endpoint(&mut self, address: u8) -> Result<EndpointInfo, TransportError>;

    /// Write raw bytes to a bulk OUT endpoint. Returns bytes accepted.
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Host-to-device control transfer.
    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Release a previously claimed interface.
    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Close the device handle. Idempotent.
    fn close(&mut self);
}

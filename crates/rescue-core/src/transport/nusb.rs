//! nusb-based USB transport implementation.

use std::io::{ErrorKind, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{
    ControlSetup, EndpointInfo, RecoveryTransport, TransportError, UsbBus, UsbDeviceRecord,
};
use crate::protocol::constants::DEFAULT_MAX_PACKET_SIZE;

/// The platform USB bus, as seen through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBus;

impl NusbBus {
    pub fn new() -> Self {
        Self
    }

    fn describe(info: &DeviceInfo) -> UsbDeviceRecord {
        let ports: Vec<String> = info.port_chain().iter().map(|p| p.to_string()).collect();
        let bus_path = if ports.is_empty() {
            format!("{}-addr{}", info.bus_id(), info.device_address())
        } else {
            format!("{}-{}", info.bus_id(), ports.join("."))
        };
        let name = info
            .product_string()
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("USB {:04X}:{:04X}", info.vendor_id(), info.product_id())
            });

        UsbDeviceRecord {
            name,
            bus_path,
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
        }
    }
}

impl UsbBus for NusbBus {
    fn scan(&self) -> Result<Vec<Result<UsbDeviceRecord, TransportError>>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        Ok(devices.map(|info| Ok(Self::describe(&info))).collect())
    }

    #[instrument(level = "info", skip(self), fields(bus_path = %record.bus_path))]
    fn open(&self, record: &UsbDeviceRecord) -> Result<Box<dyn RecoveryTransport>, TransportError> {
        let info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| Self::describe(d).bus_path == record.bus_path)
            .ok_or(TransportError::NoDeviceFound)?;

        let device = info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            vendor_id = %format!("{:04X}", record.vendor_id),
            product_id = %format!("{:04X}", record.product_id),
            "Device handle opened"
        );

        Ok(Box::new(NusbTransport {
            device: Some(device),
            interface: None,
        }))
    }
}

/// nusb-based device handle.
pub struct NusbTransport {
    device: Option<Device>,
    interface: Option<Interface>,
}

impl NusbTransport {
    fn device(&self) -> Result<&Device, TransportError> {
        self.device
            .as_ref()
            .ok_or_else(|| TransportError::OpenFailed("device handle closed".into()))
    }

    fn interface(&self, address: u8) -> Result<&Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or_else(|| TransportError::EndpointUnavailable {
                address,
                message: "interface not claimed".into(),
            })
    }
}

fn split_request_type(request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match request_type & 0x1F {
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Device,
    };
    (control_type, recipient)
}

impl RecoveryTransport for NusbTransport {
    fn set_configuration(&mut self, config: u8) -> Result<(), TransportError> {
        self.device()?
            .set_configuration(config)
            .wait()
            .map_err(|e| TransportError::ConfigurationFailed {
                config,
                message: e.to_string(),
            })
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let claimed = self
            .device()?
            .claim_interface(interface)
            .wait()
            .map_err(|e| TransportError::ClaimFailed {
                interface,
                message: e.to_string(),
            })?;
        self.interface = Some(claimed);
        Ok(())
    }

    fn open_endpoint(&mut self, address: u8) -> Result<EndpointInfo, TransportError> {
        let interface = self.interface(address)?;
        let unavailable = |e: nusb::Error| TransportError::EndpointUnavailable {
            address,
            message: e.to_string(),
        };

        // Endpoints are re-acquired per transfer; this only proves they exist.
        let max_packet_size = if address & 0x80 != 0 {
            interface
                .endpoint::<Bulk, In>(address)
                .map_err(unavailable)?
                .max_packet_size()
        } else {
            interface
                .endpoint::<Bulk, Out>(address)
                .map_err(unavailable)?
                .max_packet_size()
        };

        Ok(EndpointInfo {
            address,
            max_packet_size: if max_packet_size == 0 {
                DEFAULT_MAX_PACKET_SIZE
            } else {
                max_packet_size
            },
        })
    }

    #[instrument(skip(self, data), fields(len = data.len(), ep = %format!("0x{:02X}", endpoint)))]
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let ep = self
            .interface(endpoint)?
            .endpoint::<Bulk, Out>(endpoint)
            .map_err(|e| TransportError::EndpointUnavailable {
                address: endpoint,
                message: e.to_string(),
            })?;

        let map_io = |e: std::io::Error| {
            if e.kind() == ErrorKind::TimedOut {
                TransportError::TransferTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                TransportError::TransferFailed(e.to_string())
            }
        };

        let mut writer = ep.writer(data.len().max(1)).with_write_timeout(timeout);
        writer.write_all(data).map_err(map_io)?;
        writer.flush().map_err(map_io)?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self, data), fields(request = setup.request, len = data.len()))]
    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let (control_type, recipient) = split_request_type(setup.request_type);
        self.device()?
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| TransportError::TransferFailed(e.to_string()))
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        // nusb releases the interface when the handle is dropped.
        if self.interface.take().is_none() {
            warn!(interface, "Release requested for an interface that was not claimed");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.interface = None;
        if self.device.take().is_some() {
            debug!("Device handle closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_out_request_type() {
        let (control_type, recipient) = split_request_type(0x40);
        assert_eq!(control_type, ControlType::Vendor);
        assert_eq!(recipient, Recipient::Device);
    }

    #[test]
    fn test_class_interface_request_type() {
        let (control_type, recipient) = split_request_type(0x21);
        assert_eq!(control_type, ControlType::Class);
        assert_eq!(recipient, Recipient::Interface);
    }
}

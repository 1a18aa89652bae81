//! Mock USB transport for testing.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{
    ControlSetup, EndpointInfo, RecoveryTransport, TransportError, UsbBus, UsbDeviceRecord,
};
use crate::protocol::constants::{APPLE_VENDOR_ID, RECOVERY_MODE_PID};

/// Call counters and captured traffic shared by a bus and its handles.
#[derive(Debug, Default, Clone)]
pub struct MockStats {
    pub scans: usize,
    pub opens: usize,
    pub closes: usize,
    pub configurations: usize,
    pub claims: usize,
    pub releases: usize,
    pub endpoint_opens: usize,
    /// Captured bulk writes as `(endpoint, bytes)`.
    pub bulk_writes: Vec<(u8, Vec<u8>)>,
    /// Captured control transfers.
    pub control_transfers: Vec<ControlSetup>,
}

impl MockStats {
    /// Handles currently open (opened but not closed).
    pub fn open_handles(&self) -> usize {
        self.opens - self.closes
    }

    /// Bulk writes decoded as text, for command assertions.
    pub fn commands(&self) -> Vec<String> {
        self.bulk_writes
            .iter()
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

/// Failure injection switches.
#[derive(Debug, Default, Clone)]
pub struct MockFaults {
    pub scan: bool,
    pub open: bool,
    pub configuration: bool,
    pub claim: bool,
    pub endpoint_out: bool,
    pub endpoint_in: bool,
    pub bulk_write: bool,
    pub bulk_timeout: bool,
    pub control: bool,
    /// Enumeration entries that fail to describe themselves.
    pub broken_entries: usize,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<UsbDeviceRecord>,
    faults: MockFaults,
    stats: MockStats,
    max_packet_size: usize,
}

/// Mock bus with a configurable device list and call counting.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        let bus = Self::default();
        bus.lock().max_packet_size = 512;
        bus
    }

    /// Bus with one Apple device in recovery mode at `bus_path`.
    pub fn with_recovery_device(bus_path: &str) -> Self {
        let bus = Self::new();
        bus.attach(UsbDeviceRecord {
            name: "Apple Mobile Device (Recovery Mode)".into(),
            bus_path: bus_path.into(),
            vendor_id: APPLE_VENDOR_ID,
            product_id: RECOVERY_MODE_PID,
        });
        bus
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned mock is a failed test already.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate device arrival.
    pub fn attach(&self, record: UsbDeviceRecord) {
        self.lock().devices.push(record);
    }

    /// Simulate every device disconnecting.
    pub fn detach_all(&self) {
        self.lock().devices.clear();
    }

    pub fn set_faults(&self, faults: MockFaults) {
        self.lock().faults = faults;
    }

    pub fn set_max_packet_size(&self, size: usize) {
        self.lock().max_packet_size = size;
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MockStats {
        self.lock().stats.clone()
    }
}

impl UsbBus for MockBus {
    fn scan(&self) -> Result<Vec<Result<UsbDeviceRecord, TransportError>>, TransportError> {
        let mut state = self.lock();
        state.stats.scans += 1;
        if state.faults.scan {
            return Err(TransportError::EnumerationFailed("mock scan failure".into()));
        }

        let mut out: Vec<_> = (0..state.faults.broken_entries)
            .map(|i| {
                Err(TransportError::EnumerationFailed(format!(
                    "mock entry {i} unreadable"
                )))
            })
            .collect();
        out.extend(state.devices.iter().cloned().map(Ok));
        Ok(out)
    }

    fn open(&self, record: &UsbDeviceRecord) -> Result<Box<dyn RecoveryTransport>, TransportError> {
        let mut state = self.lock();
        if state.faults.open {
            return Err(TransportError::OpenFailed("mock open failure".into()));
        }
        if !state.devices.iter().any(|d| d.bus_path == record.bus_path) {
            return Err(TransportError::NoDeviceFound);
        }
        state.stats.opens += 1;
        Ok(Box::new(MockTransport {
            bus: self.clone(),
            claimed: false,
            closed: false,
        }))
    }
}

/// Handle returned by [`MockBus::open`].
pub struct MockTransport {
    bus: MockBus,
    claimed: bool,
    closed: bool,
}

impl MockTransport {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::OpenFailed("handle closed".into()));
        }
        Ok(())
    }
}

impl RecoveryTransport for MockTransport {
    fn set_configuration(&mut self, config: u8) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.bus.lock();
        state.stats.configurations += 1;
        if state.faults.configuration {
            return Err(TransportError::ConfigurationFailed {
                config,
                message: "mock configuration failure".into(),
            });
        }
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.bus.lock();
        if state.faults.claim {
            return Err(TransportError::ClaimFailed {
                interface,
                message: "mock claim failure".into(),
            });
        }
        state.stats.claims += 1;
        self.claimed = true;
        Ok(())
    }

    fn open_endpoint(&mut self, address: u8) -> Result<EndpointInfo, TransportError> {
        self.check_open()?;
        let mut state = self.bus.lock();
        let fails = if address & 0x80 != 0 {
            state.faults.endpoint_in
        } else {
            state.faults.endpoint_out
        };
        if fails {
            return Err(TransportError::EndpointUnavailable {
                address,
                message: "mock endpoint failure".into(),
            });
        }
        state.stats.endpoint_opens += 1;
        Ok(EndpointInfo {
            address,
            max_packet_size: state.max_packet_size,
        })
    }

    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_open()?;
        let mut state = self.bus.lock();
        if state.faults.bulk_timeout {
            return Err(TransportError::TransferTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        if state.faults.bulk_write {
            return Err(TransportError::TransferFailed("mock write failure".into()));
        }
        state.stats.bulk_writes.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn control_out(
        &mut self,
        setup: ControlSetup,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.bus.lock();
        if state.faults.control {
            return Err(TransportError::TransferFailed("mock control failure".into()));
        }
        state.stats.control_transfers.push(setup);
        Ok(())
    }

    fn release_interface(&mut self, _interface: u8) -> Result<(), TransportError> {
        if self.claimed {
            self.claimed = false;
            self.bus.lock().stats.releases += 1;
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.bus.lock().stats.closes += 1;
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_counts_open_and_close() {
        let bus = MockBus::with_recovery_device("mock-1");
        let record = bus.scan().unwrap().remove(0).unwrap();

        let mut handle = bus.open(&record).unwrap();
        assert_eq!(bus.stats().open_handles(), 1);

        handle.close();
        handle.close();
        assert_eq!(bus.stats().closes, 1);
        assert_eq!(bus.stats().open_handles(), 0);
    }

    #[test]
    fn test_mock_write_capture() {
        let bus = MockBus::with_recovery_device("mock-2");
        let record = bus.scan().unwrap().remove(0).unwrap();
        let mut handle = bus.open(&record).unwrap();

        handle.bulk_write(0x04, b"Hello", Duration::from_secs(1)).unwrap();
        handle.bulk_write(0x04, b"World", Duration::from_secs(1)).unwrap();

        assert_eq!(bus.stats().commands(), vec!["Hello", "World"]);
    }

    #[test]
    fn test_mock_broken_entries_are_reported() {
        let bus = MockBus::with_recovery_device("mock-3");
        bus.set_faults(MockFaults {
            broken_entries: 2,
            ..Default::default()
        });

        let entries = bus.scan().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().filter(|e| e.is_err()).count(), 2);
    }

    #[test]
    fn test_mock_disconnect() {
        let bus = MockBus::with_recovery_device("mock-4");
        let record = bus.scan().unwrap().remove(0).unwrap();

        bus.detach_all();
        assert!(matches!(bus.open(&record), Err(TransportError::NoDeviceFound)));
    }
}

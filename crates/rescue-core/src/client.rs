//! iRecovery protocol client.
//!
//! A [`ProtocolSession`] owns one opened Recovery/DFU device: the USB handle,
//! the claimed interface and the two bulk endpoints. Commands are newline
//! terminated ASCII on the bulk OUT endpoint; the bootloader never
//! acknowledges them, so every command is followed by a short settle delay.
//!
//! At most one session per physical device may be live. That is enforced by
//! a process-wide lease table keyed by bus path, which holds nothing but the
//! lease itself.

use std::collections::HashSet;
use std::fmt;
use std::sync::{LazyLock, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::device::{DeviceDescriptor, list_devices};
use crate::protocol::constants::*;
use crate::transport::{ControlSetup, EndpointInfo, RecoveryTransport, TransportError, UsbBus};

static LIVE_SESSIONS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(Default::default);

/// Exclusive right to open a session on one bus path.
#[derive(Debug)]
pub struct SessionLease {
    bus_path: String,
}

impl SessionLease {
    pub fn acquire(bus_path: &str) -> Result<Self, TransportError> {
        let mut live = LIVE_SESSIONS.lock().unwrap_or_else(|e| e.into_inner());
        if !live.insert(bus_path.to_string()) {
            return Err(TransportError::DeviceBusy {
                bus_path: bus_path.to_string(),
            });
        }
        Ok(Self {
            bus_path: bus_path.to_string(),
        })
    }

    pub fn bus_path(&self) -> &str {
        &self.bus_path
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut live = LIVE_SESSIONS.lock().unwrap_or_else(|e| e.into_inner());
        live.remove(&self.bus_path);
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Timeout of every bulk/control transfer.
    pub transfer_timeout: Duration,
    /// Pause after each command; the bootloader has no ack.
    pub command_settle: Duration,
    /// Pause after a successful reboot command.
    pub reboot_settle: Duration,
    /// Pause between the auto-boot environment commands.
    pub env_settle: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_millis(USB_TIMEOUT_MS),
            command_settle: Duration::from_millis(COMMAND_SETTLE_MS),
            reboot_settle: Duration::from_millis(REBOOT_SETTLE_MS),
            env_settle: Duration::from_millis(ENV_SETTLE_MS),
        }
    }
}

impl ClientSettings {
    /// All delays zeroed, for tests and mocks.
    pub fn immediate() -> Self {
        Self {
            command_settle: Duration::ZERO,
            reboot_settle: Duration::ZERO,
            env_settle: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Which reboot variant the device accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootMethod {
    /// Plain `reboot` command.
    Command,
    /// `setenv auto-boot true` / `saveenv` / `reboot`.
    AutoBoot,
    /// Zero-length vendor control transfer.
    ControlTransfer,
}

impl fmt::Display for RebootMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootMethod::Command => write!(f, "bulk reboot command"),
            RebootMethod::AutoBoot => write!(f, "auto-boot + reboot sequence"),
            RebootMethod::ControlTransfer => write!(f, "control transfer"),
        }
    }
}

/// Live USB session with a Recovery/DFU device.
pub struct ProtocolSession {
    transport: Box<dyn RecoveryTransport>,
    device: DeviceDescriptor,
    settings: ClientSettings,
    claimed: bool,
    writer: Option<EndpointInfo>,
    reader: Option<EndpointInfo>,
    invalidated: bool,
    closed: bool,
    // Dropped after the handle is closed.
    _lease: SessionLease,
}

impl ProtocolSession {
    /// Open the first Apple device in Recovery or DFU mode.
    #[instrument(level = "info", skip_all)]
    pub fn open(bus: &dyn UsbBus, settings: ClientSettings) -> Result<Self, TransportError> {
        info!("Searching for recovery mode device...");
        let candidates: Vec<DeviceDescriptor> = list_devices(bus)?
            .into_iter()
            .filter(|d| d.mode.accepts_session())
            .collect();

        let mut last_error = None;
        for device in candidates {
            info!(device = %device, "Found Apple device in recovery/DFU mode");

            let lease = match SessionLease::acquire(&device.bus_path) {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(error = %e, "Device already in use - trying next");
                    last_error = Some(e);
                    continue;
                }
            };

            match bus.open(&device.record()) {
                Ok(transport) => return Ok(Self::establish(transport, device, lease, settings)),
                Err(e) => {
                    warn!(error = %e, "Failed to open device - trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::NoDeviceFound))
    }

    fn establish(
        mut transport: Box<dyn RecoveryTransport>,
        device: DeviceDescriptor,
        lease: SessionLease,
        settings: ClientSettings,
    ) -> Self {
        // Some drivers expose an already-configured interface, so neither of
        // these is fatal.
        match transport.set_configuration(USB_CONFIGURATION) {
            Ok(()) => debug!("Configuration set"),
            Err(e) => warn!(error = %e, "Configuration failed, continuing"),
        }

        let claimed = match transport.claim_interface(USB_INTERFACE) {
            Ok(()) => {
                debug!("Interface claimed");
                true
            }
            Err(e) => {
                warn!(error = %e, "Claim interface failed, continuing");
                false
            }
        };

        let writer = match transport.open_endpoint(ENDPOINT_OUT) {
            Ok(ep) => {
                debug!(max_packet = ep.max_packet_size, "Endpoint writer opened (0x04)");
                Some(ep)
            }
            Err(e) => {
                warn!(error = %e, "Endpoint writer failed");
                None
            }
        };

        let reader = match transport.open_endpoint(ENDPOINT_IN) {
            Ok(ep) => {
                debug!("Endpoint reader opened (0x85)");
                Some(ep)
            }
            Err(e) => {
                warn!(error = %e, "Endpoint reader failed");
                None
            }
        };

        info!(
            bus_path = %device.bus_path,
            claimed,
            command_channel = writer.is_some(),
            status_channel = reader.is_some(),
            "USB session established"
        );

        Self {
            transport,
            device,
            settings,
            claimed,
            writer,
            reader,
            invalidated: false,
            closed: false,
            _lease: lease,
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn has_command_channel(&self) -> bool {
        self.writer.is_some()
    }

    pub fn has_status_channel(&self) -> bool {
        self.reader.is_some()
    }

    /// False once any reboot variant has succeeded or the session is closed.
    pub fn is_usable(&self) -> bool {
        !self.invalidated && !self.closed
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(TransportError::SessionInvalidated)
        }
    }

    fn command_endpoint(&self) -> Result<EndpointInfo, TransportError> {
        self.writer.ok_or(TransportError::EndpointUnavailable {
            address: ENDPOINT_OUT,
            message: "command endpoint was not opened".into(),
        })
    }

    /// Send one iBoot command. Success means all bytes were accepted.
    #[instrument(skip(self))]
    pub fn send_command(&mut self, command: &str) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let ep = self.command_endpoint()?;

        let line = format!("{command}\n");
        let written =
            self.transport
                .bulk_write(ep.address, line.as_bytes(), self.settings.transfer_timeout)?;
        if written != line.len() {
            return Err(TransportError::TransferFailed(format!(
                "short write: {written}/{} bytes",
                line.len()
            )));
        }

        debug!(bytes = written, "Command sent");
        thread::sleep(self.settings.command_settle);
        Ok(())
    }

    /// Upload a file image over the command endpoint.
    ///
    /// Payloads above [`SINGLE_WRITE_THRESHOLD`] are split into writes of the
    /// endpoint's maximum packet size.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn send_file(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.ensure_usable()?;
        let ep = self.command_endpoint()?;
        let timeout = self.settings.transfer_timeout;

        if data.len() <= SINGLE_WRITE_THRESHOLD {
            let written = self.transport.bulk_write(ep.address, data, timeout)?;
            return Ok(written);
        }

        let chunk_size = ep.max_packet_size.max(1);
        let total_chunks = data.len().div_ceil(chunk_size);
        let mut sent = 0usize;

        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let written = self.transport.bulk_write(ep.address, chunk, timeout)?;
            if written != chunk.len() {
                return Err(TransportError::TransferFailed(format!(
                    "short write in chunk {}/{}: {written}/{} bytes",
                    index + 1,
                    total_chunks,
                    chunk.len()
                )));
            }
            sent += written;
        }

        debug!(bytes = sent, chunks = total_chunks, "File sent");
        Ok(sent)
    }

    /// Vendor-specific host-to-device control transfer.
    #[instrument(skip(self, payload))]
    pub fn control_transfer(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let setup = ControlSetup {
            request_type: REQ_TYPE_VENDOR_OUT,
            request,
            value,
            index,
        };
        self.transport
            .control_out(setup, payload, self.settings.transfer_timeout)
    }

    /// Reboot the device out of the bootloader.
    ///
    /// Tries the plain command, then the auto-boot sequence, then a
    /// zero-length control transfer. On success the device disconnects and
    /// the session is invalidated; every later call fails with
    /// [`TransportError::SessionInvalidated`].
    pub fn reboot(&mut self) -> Result<RebootMethod, TransportError> {
        self.ensure_usable()?;
        let mut reasons = Vec::with_capacity(3);

        info!("Method 1: bulk transfer reboot command");
        match self.send_command(CMD_REBOOT) {
            Ok(()) => {
                thread::sleep(self.settings.reboot_settle);
                return Ok(self.rebooted(RebootMethod::Command));
            }
            Err(e) => reasons.push(format!("reboot command: {e}")),
        }

        info!("Method 2: set auto-boot and reboot");
        if let Err(e) = self.send_command(CMD_SETENV_AUTOBOOT) {
            debug!(error = %e, "setenv failed");
        }
        thread::sleep(self.settings.env_settle);
        if let Err(e) = self.send_command(CMD_SAVEENV) {
            debug!(error = %e, "saveenv failed");
        }
        thread::sleep(self.settings.env_settle);
        match self.send_command(CMD_REBOOT) {
            Ok(()) => return Ok(self.rebooted(RebootMethod::AutoBoot)),
            Err(e) => reasons.push(format!("auto-boot sequence: {e}")),
        }

        info!("Method 3: control transfer");
        match self.control_transfer(REQ_REBOOT, 0, 0, &[]) {
            Ok(()) => return Ok(self.rebooted(RebootMethod::ControlTransfer)),
            Err(e) => reasons.push(format!("control transfer: {e}")),
        }

        warn!("All reboot methods failed");
        Err(TransportError::TransferFailed(reasons.join("; ")))
    }

    fn rebooted(&mut self, method: RebootMethod) -> RebootMethod {
        info!(method = %method, "Reboot accepted; session is no longer usable");
        self.invalidated = true;
        method
    }

    /// Release the interface and close the handle.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.claimed {
            if let Err(e) = self.transport.release_interface(USB_INTERFACE) {
                warn!(error = %e, "Error releasing interface");
            }
            self.claimed = false;
        }
        self.transport.close();
        debug!(bus_path = %self.device.bus_path, "Device connection closed");
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open a session, reboot, close.
pub fn exit_recovery_mode(
    bus: &dyn UsbBus,
    settings: ClientSettings,
) -> Result<RebootMethod, TransportError> {
    let mut session = ProtocolSession::open(bus, settings)?;
    let result = session.reboot();
    session.close();
    result
}

//! Bootloader flash sequence and ramdisk/kernel loading.
//!
//! The boot ROM needs iBSS, then iBEC, each followed by a settle delay
//! before it will accept anything else. The delays are part of the
//! protocol; skipping them hangs the device.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::bundle::{Component, FirmwareBundle};
use crate::cancel::{CancelToken, PollPolicy};
use crate::client::{ClientSettings, ProtocolSession};
use crate::device::find_session_device;
use crate::protocol::constants::{CMD_BOOTX, CMD_DEVICETREE, CMD_RAMDISK};
use crate::tools::RecoveryTool;
use crate::transport::UsbBus;
use crate::tss::SigningOutcome;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Device not in recovery mode after {attempts} checks")]
    DeviceNotInRecovery { attempts: u32 },

    #[error("Failed to send {what}: {reason}")]
    SendFailed { what: String, reason: String },

    #[error("Flash sequence cancelled")]
    Cancelled,
}

/// Steps of the flash state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStep {
    VerifyRecoveryMode,
    SendIbss,
    SettleAfterIbss,
    SendIbec,
    SettleAfterIbec,
    Ready,
}

impl fmt::Display for FlashStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashStep::VerifyRecoveryMode => write!(f, "verify recovery mode"),
            FlashStep::SendIbss => write!(f, "send iBSS"),
            FlashStep::SettleAfterIbss => write!(f, "settle after iBSS"),
            FlashStep::SendIbec => write!(f, "send iBEC"),
            FlashStep::SettleAfterIbec => write!(f, "settle after iBEC"),
            FlashStep::Ready => write!(f, "ready"),
        }
    }
}

/// Whether a component goes out with a blob from the signing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMode {
    Signed,
    Unsigned,
}

impl SigningMode {
    /// Signed only when the negotiation returned a blob for `component`.
    pub fn for_component(signing: &SigningOutcome, component: Component) -> Self {
        match signing {
            SigningOutcome::Signed(blobs) if blobs.contains_key(component.name()) => {
                SigningMode::Signed
            }
            _ => SigningMode::Unsigned,
        }
    }
}

impl fmt::Display for SigningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningMode::Signed => write!(f, "signed"),
            SigningMode::Unsigned => write!(f, "unsigned"),
        }
    }
}

/// What the flash sequence needs from the device side.
pub trait FlashBackend {
    /// One enumeration check; no waiting.
    fn is_recovery_present(&mut self) -> bool;

    /// Upload one component file.
    fn send_file(
        &mut self,
        component: Component,
        path: &Path,
        mode: SigningMode,
    ) -> Result<(), FlashError>;

    /// Send one bootloader command.
    fn send_command(&mut self, command: &str) -> Result<(), FlashError>;

    /// Wait; `false` if cut short by cancellation.
    fn delay(&mut self, duration: Duration) -> bool;
}

/// Drives iBSS then iBEC onto the device.
#[derive(Debug, Clone, Copy)]
pub struct FlashSequencer {
    pub verify: PollPolicy,
    pub settle: Duration,
}

impl Default for FlashSequencer {
    fn default() -> Self {
        Self {
            verify: PollPolicy::new(30, Duration::from_secs(1)),
            settle: Duration::from_secs(3),
        }
    }
}

impl FlashSequencer {
    /// Run the sequence; stops at the first failing step.
    #[instrument(skip_all, fields(signed = signing.is_signed()))]
    pub fn flash(
        &self,
        backend: &mut dyn FlashBackend,
        ibss: &Path,
        ibec: &Path,
        signing: &SigningOutcome,
    ) -> Result<(), FlashError> {
        let mode = |component| SigningMode::for_component(signing, component);
        let mut step = FlashStep::VerifyRecoveryMode;
        loop {
            info!(step = %step, "Flash step");
            step = match step {
                FlashStep::VerifyRecoveryMode => {
                    self.wait_for_recovery(backend)?;
                    FlashStep::SendIbss
                }
                FlashStep::SendIbss => {
                    backend.send_file(Component::Ibss, ibss, mode(Component::Ibss))?;
                    FlashStep::SettleAfterIbss
                }
                FlashStep::SettleAfterIbss => {
                    if !backend.delay(self.settle) {
                        return Err(FlashError::Cancelled);
                    }
                    FlashStep::SendIbec
                }
                FlashStep::SendIbec => {
                    backend.send_file(Component::Ibec, ibec, mode(Component::Ibec))?;
                    FlashStep::SettleAfterIbec
                }
                FlashStep::SettleAfterIbec => {
                    if !backend.delay(self.settle) {
                        return Err(FlashError::Cancelled);
                    }
                    FlashStep::Ready
                }
                FlashStep::Ready => {
                    info!("Bootloader flashing complete");
                    return Ok(());
                }
            };
        }
    }

    fn wait_for_recovery(&self, backend: &mut dyn FlashBackend) -> Result<(), FlashError> {
        for attempt in 0..self.verify.attempts {
            if backend.is_recovery_present() {
                return Ok(());
            }
            if attempt + 1 < self.verify.attempts && !backend.delay(self.verify.interval) {
                return Err(FlashError::Cancelled);
            }
        }
        Err(FlashError::DeviceNotInRecovery {
            attempts: self.verify.attempts,
        })
    }
}

/// What the best-effort ramdisk/kernel load did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<Component>,
    pub notes: Vec<String>,
}

/// Upload device tree, ramdisk and kernel, each followed by its boot
/// command. Nothing here is fatal except cancellation.
pub fn load_ramdisk_and_kernel(
    backend: &mut dyn FlashBackend,
    bundle: &FirmwareBundle,
    signing: &SigningOutcome,
    settle: Duration,
) -> Result<LoadReport, FlashError> {
    let mut report = LoadReport::default();

    for (component, command) in [
        (Component::DeviceTree, CMD_DEVICETREE),
        (Component::RestoreRamDisk, CMD_RAMDISK),
        (Component::KernelCache, CMD_BOOTX),
    ] {
        let Some(path) = bundle.get(component).and_then(|d| d.path()) else {
            let note = format!("{component}: not available in firmware (normal for newer OS versions)");
            info!("{}", note);
            report.notes.push(note);
            continue;
        };

        let mode = SigningMode::for_component(signing, component);
        if let Err(e) = backend.send_file(component, path, mode) {
            if matches!(e, FlashError::Cancelled) {
                return Err(e);
            }
            let note = format!("{component} load skipped: {e}");
            warn!("{}", note);
            report.notes.push(note);
            continue;
        }
        if !backend.delay(settle) {
            return Err(FlashError::Cancelled);
        }

        match backend.send_command(command) {
            Ok(()) => report.loaded.push(component),
            Err(FlashError::Cancelled) => return Err(FlashError::Cancelled),
            Err(e) => {
                let note = format!("{command} command failed: {e}");
                warn!("{}", note);
                report.notes.push(note);
            }
        }
        if !backend.delay(settle) {
            return Err(FlashError::Cancelled);
        }
    }

    Ok(report)
}

/// Real device backend: the bundled tool when present, else the in-process
/// USB client.
pub struct DeviceFlashBackend<'a> {
    bus: &'a dyn UsbBus,
    tool: Option<&'a dyn RecoveryTool>,
    client: ClientSettings,
    cancel: CancelToken,
}

impl<'a> DeviceFlashBackend<'a> {
    pub fn new(
        bus: &'a dyn UsbBus,
        tool: Option<&'a dyn RecoveryTool>,
        client: ClientSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            bus,
            tool,
            client,
            cancel,
        }
    }

    fn with_session<T>(
        &self,
        what: &str,
        f: impl FnOnce(&mut ProtocolSession) -> Result<T, crate::transport::TransportError>,
    ) -> Result<T, FlashError> {
        let send_failed = |reason: String| FlashError::SendFailed {
            what: what.to_string(),
            reason,
        };
        let mut session =
            ProtocolSession::open(self.bus, self.client).map_err(|e| send_failed(e.to_string()))?;
        let result = f(&mut session).map_err(|e| send_failed(e.to_string()));
        session.close();
        result
    }
}

impl FlashBackend for DeviceFlashBackend<'_> {
    fn is_recovery_present(&mut self) -> bool {
        find_session_device(self.bus).is_some()
    }

    fn send_file(
        &mut self,
        component: Component,
        path: &Path,
        mode: SigningMode,
    ) -> Result<(), FlashError> {
        if self.cancel.is_cancelled() {
            return Err(FlashError::Cancelled);
        }
        // Images go out as extracted; a blob only changes how the send is reported.
        info!(component = %component, mode = %mode, path = %path.display(), "Sending file");

        if let Some(tool) = self.tool {
            return tool
                .send_file(path, &self.cancel)
                .map(|_| ())
                .map_err(|e| {
                    if e.is_cancelled() {
                        FlashError::Cancelled
                    } else {
                        FlashError::SendFailed {
                            what: component.to_string(),
                            reason: e.to_string(),
                        }
                    }
                });
        }

        let data = std::fs::read(path).map_err(|e| FlashError::SendFailed {
            what: component.to_string(),
            reason: e.to_string(),
        })?;
        self.with_session(component.name(), |session| session.send_file(&data).map(|_| ()))
    }

    fn send_command(&mut self, command: &str) -> Result<(), FlashError> {
        if self.cancel.is_cancelled() {
            return Err(FlashError::Cancelled);
        }
        info!(command, "Sending command");

        if let Some(tool) = self.tool {
            return tool
                .send_command(command, &self.cancel)
                .map(|_| ())
                .map_err(|e| {
                    if e.is_cancelled() {
                        FlashError::Cancelled
                    } else {
                        FlashError::SendFailed {
                            what: command.to_string(),
                            reason: e.to_string(),
                        }
                    }
                });
        }

        self.with_session(command, |session| session.send_command(command))
    }

    fn delay(&mut self, duration: Duration) -> bool {
        self.cancel.sleep(duration)
    }
}

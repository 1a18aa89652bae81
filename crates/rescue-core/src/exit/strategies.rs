//! The four exit strategies, in chain order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use super::native::NativeRecoveryApi;
use super::{ExitStrategy, StrategyOutcome};
use crate::cancel::{CancelToken, PollPolicy};
use crate::client::{ClientSettings, SessionLease, exit_recovery_mode};
use crate::device::list_devices;
use crate::protocol::DeviceMode;
use crate::protocol::constants::{
    CMD_REBOOT, CMD_SAVEENV, CMD_SETENV_AUTOBOOT, REQ_REBOOT, REQ_TYPE_VENDOR_OUT, USB_TIMEOUT_MS,
};
use crate::tools::RecoveryTool;
use crate::transport::{ControlSetup, TransportError, UsbBus};

/// 1. Vendor device-support service: set auto-boot, then reboot.
pub struct NativeApiStrategy {
    api: Arc<dyn NativeRecoveryApi>,
    wait: PollPolicy,
}

impl NativeApiStrategy {
    pub fn new(api: Arc<dyn NativeRecoveryApi>, wait: PollPolicy) -> Self {
        Self { api, wait }
    }
}

impl ExitStrategy for NativeApiStrategy {
    fn name(&self) -> &str {
        "native device API"
    }

    fn attempt(&self, cancel: &CancelToken) -> anyhow::Result<StrategyOutcome> {
        if !self.api.is_available() {
            return Ok(StrategyOutcome::Failed(
                "vendor device service not installed".into(),
            ));
        }

        info!("Waiting for recovery device notification...");
        let Some(device) = self.wait.poll(cancel, || self.api.recovery_device()) else {
            return Ok(StrategyOutcome::Failed(
                "no recovery mode device reported".into(),
            ));
        };

        self.api
            .set_auto_boot(&device, true)
            .context("set auto-boot failed")?;
        self.api.reboot(&device).context("reboot failed")?;
        Ok(StrategyOutcome::Succeeded(format!(
            "device {} rebooted",
            device.id
        )))
    }
}

/// 2. Bundled recovery tool: `-m` check, then `setenv`/`saveenv`/`reboot`.
pub struct ToolAutoBootStrategy {
    tool: Option<Arc<dyn RecoveryTool>>,
}

impl ToolAutoBootStrategy {
    pub fn new(tool: Option<Arc<dyn RecoveryTool>>) -> Self {
        Self { tool }
    }
}

impl ExitStrategy for ToolAutoBootStrategy {
    fn name(&self) -> &str {
        "recovery tool (auto-boot)"
    }

    fn attempt(&self, cancel: &CancelToken) -> anyhow::Result<StrategyOutcome> {
        let Some(tool) = self.tool.as_deref() else {
            return Ok(StrategyOutcome::Failed("recovery tool not configured".into()));
        };
        if !tool.is_available() {
            return Ok(StrategyOutcome::Failed("recovery tool not found".into()));
        }

        match tool.query_mode(cancel)? {
            Some(mode) if mode != DeviceMode::Normal => {
                info!(mode = %mode, "Device found by recovery tool");
            }
            _ => {
                return Ok(StrategyOutcome::Failed(
                    "device not found in recovery mode".into(),
                ));
            }
        }

        // Intermediate steps may print nothing or fail on some bootloaders;
        // only the final reboot decides.
        for command in [CMD_SETENV_AUTOBOOT, CMD_SAVEENV] {
            let out = tool.run(&["-c", command], cancel)?;
            if !out.success() {
                warn!(command, code = out.code, "Command returned non-zero exit code");
            }
        }

        let out = tool.run(&["-c", CMD_REBOOT], cancel)?;
        if out.success() {
            Ok(StrategyOutcome::Succeeded("reboot command accepted".into()))
        } else {
            Ok(StrategyOutcome::Failed(format!(
                "reboot failed with exit code {}: {}",
                out.code,
                out.detail()
            )))
        }
    }
}

/// 3. In-process USB protocol client: open a session and reboot.
pub struct ProtocolClientStrategy {
    bus: Arc<dyn UsbBus>,
    settings: ClientSettings,
}

impl ProtocolClientStrategy {
    pub fn new(bus: Arc<dyn UsbBus>, settings: ClientSettings) -> Self {
        Self { bus, settings }
    }
}

impl ExitStrategy for ProtocolClientStrategy {
    fn name(&self) -> &str {
        "USB protocol client"
    }

    fn attempt(&self, _cancel: &CancelToken) -> anyhow::Result<StrategyOutcome> {
        let method = exit_recovery_mode(self.bus.as_ref(), self.settings)?;
        Ok(StrategyOutcome::Succeeded(format!("reboot via {method}")))
    }
}

/// 4. Raw handle: one zero-length vendor control transfer, nothing else.
pub struct RawControlStrategy {
    bus: Arc<dyn UsbBus>,
    timeout: Duration,
}

impl RawControlStrategy {
    pub fn new(bus: Arc<dyn UsbBus>) -> Self {
        Self {
            bus,
            timeout: Duration::from_millis(USB_TIMEOUT_MS),
        }
    }
}

impl ExitStrategy for RawControlStrategy {
    fn name(&self) -> &str {
        "raw control transfer"
    }

    fn attempt(&self, _cancel: &CancelToken) -> anyhow::Result<StrategyOutcome> {
        let device = list_devices(self.bus.as_ref())?
            .into_iter()
            .find(|d| d.mode.accepts_session())
            .ok_or(TransportError::NoDeviceFound)?;

        let _lease = SessionLease::acquire(&device.bus_path)?;
        let mut handle = self.bus.open(&device.record())?;
        debug!(bus_path = %device.bus_path, "Raw handle opened");

        let setup = ControlSetup {
            request_type: REQ_TYPE_VENDOR_OUT,
            request: REQ_REBOOT,
            value: 0,
            index: 0,
        };
        let result = handle.control_out(setup, &[], self.timeout);
        handle.close();
        result?;

        Ok(StrategyOutcome::Succeeded("control transfer accepted".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::native::{NativeDevice, UnavailableNativeApi};
    use crate::tools::irecovery::tests::{ScriptedTool, ok};
    use crate::tools::{ToolError, ToolOutput};
    use crate::transport::{MockBus, MockFaults};
    use std::sync::Mutex;

    struct FakeNative {
        calls: Mutex<Vec<&'static str>>,
    }

    impl NativeRecoveryApi for FakeNative {
        fn is_available(&self) -> bool {
            true
        }

        fn recovery_device(&self) -> Option<NativeDevice> {
            Some(NativeDevice { id: "dev0".into() })
        }

        fn set_auto_boot(&self, _device: &NativeDevice, _enabled: bool) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("autoboot");
            Ok(())
        }

        fn reboot(&self, _device: &NativeDevice) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("reboot");
            Ok(())
        }
    }

    fn no_wait() -> PollPolicy {
        PollPolicy::new(1, Duration::ZERO)
    }

    #[test]
    fn test_native_unavailable_fails_softly() {
        let strategy = NativeApiStrategy::new(Arc::new(UnavailableNativeApi), no_wait());
        let outcome = strategy.attempt(&CancelToken::new()).unwrap();
        assert!(matches!(outcome, StrategyOutcome::Failed(_)));
    }

    #[test]
    fn test_native_sets_autoboot_then_reboots() {
        let api = Arc::new(FakeNative {
            calls: Mutex::new(Vec::new()),
        });
        let strategy = NativeApiStrategy::new(api.clone(), no_wait());
        let outcome = strategy.attempt(&CancelToken::new()).unwrap();
        assert!(matches!(outcome, StrategyOutcome::Succeeded(_)));
        assert_eq!(*api.calls.lock().unwrap(), vec!["autoboot", "reboot"]);
    }

    #[test]
    fn test_tool_sequence_and_final_exit_code() {
        let tool = Arc::new(ScriptedTool::new(|args| match args {
            ["-m"] => ok("MODE: Recovery"),
            ["-c", "saveenv"] => Ok(ToolOutput {
                code: 1,
                ..Default::default()
            }),
            _ => ok(""),
        }));
        let strategy = ToolAutoBootStrategy::new(Some(tool.clone()));
        let outcome = strategy.attempt(&CancelToken::new()).unwrap();

        assert!(matches!(outcome, StrategyOutcome::Succeeded(_)));
        let calls = tool.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1], vec!["-c", "setenv auto-boot true"]);
        assert_eq!(calls[2], vec!["-c", "saveenv"]);
        assert_eq!(calls[3], vec!["-c", "reboot"]);
    }

    #[test]
    fn test_tool_reboot_failure_fails_strategy() {
        let tool = Arc::new(ScriptedTool::new(|args| match args {
            ["-m"] => ok("MODE: Recovery"),
            ["-c", "reboot"] => Ok(ToolOutput {
                code: 255,
                stdout: String::new(),
                stderr: "ERROR: device disconnected".into(),
            }),
            _ => ok(""),
        }));
        let outcome = ToolAutoBootStrategy::new(Some(tool))
            .attempt(&CancelToken::new())
            .unwrap();
        match outcome {
            StrategyOutcome::Failed(reason) => assert!(reason.contains("255")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_tool_without_device_skips_commands() {
        let tool = Arc::new(ScriptedTool::new(|_| {
            Ok(ToolOutput {
                code: 255,
                ..Default::default()
            })
        }));
        let outcome = ToolAutoBootStrategy::new(Some(tool.clone()))
            .attempt(&CancelToken::new())
            .unwrap();
        assert!(matches!(outcome, StrategyOutcome::Failed(_)));
        assert_eq!(tool.calls().len(), 1);
    }

    #[test]
    fn test_tool_spawn_error_is_reported() {
        let tool = Arc::new(ScriptedTool::new(|_| {
            Err(ToolError::NotFound {
                tool: "irecovery".into(),
            })
        }));
        let result = ToolAutoBootStrategy::new(Some(tool)).attempt(&CancelToken::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_protocol_client_strategy() {
        let bus = MockBus::with_recovery_device("exit-proto");
        let strategy =
            ProtocolClientStrategy::new(Arc::new(bus.clone()), ClientSettings::immediate());
        let outcome = strategy.attempt(&CancelToken::new()).unwrap();
        assert!(matches!(outcome, StrategyOutcome::Succeeded(_)));
        assert_eq!(bus.stats().commands(), vec!["reboot\n"]);
        assert_eq!(bus.stats().open_handles(), 0);
    }

    #[test]
    fn test_raw_control_bypasses_session_setup() {
        let bus = MockBus::with_recovery_device("exit-raw");
        let outcome = RawControlStrategy::new(Arc::new(bus.clone()))
            .attempt(&CancelToken::new())
            .unwrap();
        assert!(matches!(outcome, StrategyOutcome::Succeeded(_)));

        let stats = bus.stats();
        assert_eq!(stats.claims, 0);
        assert_eq!(stats.configurations, 0);
        assert_eq!(stats.control_transfers.len(), 1);
        assert_eq!(stats.open_handles(), 0);
    }

    #[test]
    fn test_raw_control_failure_closes_handle() {
        let bus = MockBus::with_recovery_device("exit-raw-fail");
        bus.set_faults(MockFaults {
            control: true,
            ..Default::default()
        });
        let result = RawControlStrategy::new(Arc::new(bus.clone())).attempt(&CancelToken::new());
        assert!(result.is_err());
        assert_eq!(bus.stats().open_handles(), 0);
    }
}

//! Restore configuration, persisted as TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cancel::PollPolicy;
use crate::client::ClientSettings;
use crate::state::{FlashSequencer, ManualHandoff};
use crate::tss::DEFAULT_SIGNING_URL;

/// Configuration for a restore or exit operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Path to the IPSW archive.
    pub archive: Option<PathBuf>,
    /// Erase the device rather than update it.
    pub erase: bool,
    /// Explicit path to the bundled `irecovery` binary.
    pub irecovery_path: Option<PathBuf>,
    /// Directory holding the libimobiledevice tools.
    pub tool_dir: Option<PathBuf>,
    /// Signing service endpoint.
    pub signing_url: String,
    /// Parent of the per-run scratch directory. System temp dir when unset.
    pub scratch_root: Option<PathBuf>,
    pub timing: TimingConfig,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            archive: None,
            erase: false,
            irecovery_path: None,
            tool_dir: None,
            signing_url: DEFAULT_SIGNING_URL.to_string(),
            scratch_root: None,
            timing: TimingConfig::default(),
        }
    }
}

impl RestoreConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RestoreConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Polling and settle timings. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    /// Polls while waiting for any device in `DetectDevice`.
    pub detect_attempts: u32,
    /// Polls while waiting for the device to reappear in recovery mode.
    pub recovery_attempts: u32,
    /// Polls before the flash sequence gives up on the device.
    pub flash_verify_attempts: u32,
    /// Polls for the vendor service to report a recovery device.
    pub native_wait_attempts: u32,
    pub settle_ms: u64,
    pub command_settle_ms: u64,
    pub handoff_steps: u8,
    pub handoff_tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            detect_attempts: 30,
            recovery_attempts: 20,
            flash_verify_attempts: 30,
            native_wait_attempts: 3,
            settle_ms: 3000,
            command_settle_ms: 100,
            handoff_steps: 10,
            handoff_tick_ms: 1000,
        }
    }
}

impl TimingConfig {
    /// Every wait and delay set to zero, with single-shot polls.
    pub fn immediate() -> Self {
        Self {
            poll_interval_ms: 0,
            detect_attempts: 1,
            recovery_attempts: 1,
            flash_verify_attempts: 1,
            native_wait_attempts: 1,
            settle_ms: 0,
            command_settle_ms: 0,
            handoff_steps: 3,
            handoff_tick_ms: 0,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn detect_policy(&self) -> PollPolicy {
        PollPolicy::new(self.detect_attempts, self.poll_interval())
    }

    pub fn recovery_policy(&self) -> PollPolicy {
        PollPolicy::new(self.recovery_attempts, self.poll_interval())
    }

    pub fn native_wait_policy(&self) -> PollPolicy {
        PollPolicy::new(self.native_wait_attempts, self.poll_interval())
    }

    pub fn flash_sequencer(&self) -> FlashSequencer {
        FlashSequencer {
            verify: PollPolicy::new(self.flash_verify_attempts, self.poll_interval()),
            settle: self.settle(),
        }
    }

    pub fn handoff(&self) -> ManualHandoff {
        ManualHandoff {
            steps: self.handoff_steps,
            tick: Duration::from_millis(self.handoff_tick_ms),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        if self.command_settle_ms == 0 {
            return ClientSettings::immediate();
        }
        ClientSettings {
            command_settle: Duration::from_millis(self.command_settle_ms),
            ..ClientSettings::default()
        }
    }
}

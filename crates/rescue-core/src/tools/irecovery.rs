//! The bundled recovery CLI tool (`irecovery`).
//!
//! Success is exit code 0. Output is only interpreted for `-m` and `-q`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use super::process::{ExternalTool, ToolError, ToolOutput};
use crate::cancel::CancelToken;
use crate::protocol::DeviceMode;

/// Default per-invocation timeout. File uploads of a few MB fit easily.
pub const IRECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Contract of the bundled recovery tool.
///
/// Only [`RecoveryTool::run`] and [`RecoveryTool::is_available`] need to be
/// provided; the typed operations are built on top of them.
pub trait RecoveryTool: Send + Sync {
    fn is_available(&self) -> bool;

    fn run(&self, args: &[&str], cancel: &CancelToken) -> Result<ToolOutput, ToolError>;

    /// `-f <path>`: upload a file to the device.
    fn send_file(&self, path: &Path, cancel: &CancelToken) -> Result<ToolOutput, ToolError> {
        let path = path.to_string_lossy();
        self.run(&["-f", &path], cancel)?.check("irecovery -f")
    }

    /// `-c "<command>"`: send one iBoot command.
    fn send_command(&self, command: &str, cancel: &CancelToken) -> Result<ToolOutput, ToolError> {
        self.run(&["-c", command], cancel)?.check("irecovery -c")
    }

    /// `-m`: mode of the attached device, if any.
    fn query_mode(&self, cancel: &CancelToken) -> Result<Option<DeviceMode>, ToolError> {
        let out = self.run(&["-m"], cancel)?;
        if !out.success() {
            return Ok(None);
        }
        Ok(parse_mode(&out.stdout))
    }

    /// `-q`: identity of the attached device as key/value pairs.
    fn query_info(&self, cancel: &CancelToken) -> Result<BTreeMap<String, String>, ToolError> {
        let out = self.run(&["-q"], cancel)?.check("irecovery -q")?;
        Ok(parse_key_values(&out.stdout))
    }
}

/// `irecovery` spawned as a child process.
#[derive(Debug, Clone)]
pub struct IrecoveryCli {
    tool: ExternalTool,
}

impl IrecoveryCli {
    pub fn new(tool: ExternalTool) -> Self {
        Self { tool }
    }

    /// `irecovery` in `dir`, or on PATH.
    pub fn locate(dir: Option<&Path>) -> Self {
        Self::new(ExternalTool::locate(dir, "irecovery", IRECOVERY_TIMEOUT))
    }

    pub fn program(&self) -> &Path {
        self.tool.program()
    }
}

impl RecoveryTool for IrecoveryCli {
    fn is_available(&self) -> bool {
        self.tool.is_available()
    }

    fn run(&self, args: &[&str], cancel: &CancelToken) -> Result<ToolOutput, ToolError> {
        info!(program = %self.tool.program().display(), args = ?args, "Running irecovery");
        let out = self.tool.run(args, cancel)?;
        for line in out.stdout.lines().chain(out.stderr.lines()) {
            let line = line.trim();
            if !line.is_empty() {
                debug!("  {}", line);
            }
        }
        Ok(out)
    }
}

/// Parse `KEY: value` lines; keys are upper-cased, blank lines skipped.
pub fn parse_key_values(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_ascii_uppercase(), value.trim().to_string()))
        })
        .collect()
}

/// Interpret `-m` output (`MODE: Recovery`, or a bare mode word).
pub fn parse_mode(text: &str) -> Option<DeviceMode> {
    let values = parse_key_values(text);
    let word = values
        .get("MODE")
        .cloned()
        .unwrap_or_else(|| text.trim().to_string());
    let word = word.to_ascii_lowercase();

    if word.is_empty() {
        None
    } else if word.contains("recovery") {
        Some(DeviceMode::Recovery)
    } else if word.contains("dfu") {
        Some(DeviceMode::Dfu)
    } else if word.contains("wtf") {
        Some(DeviceMode::Wtf)
    } else if word.contains("normal") {
        Some(DeviceMode::Normal)
    } else {
        Some(DeviceMode::Unknown)
    }
}

/// Device identifiers reported by `-q` in recovery mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryIdentity {
    pub ecid: Option<String>,
    pub chip_id: Option<String>,
    pub board_id: Option<String>,
    pub product_type: Option<String>,
}

impl RecoveryIdentity {
    pub fn from_query(values: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| values.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            ecid: get("ECID"),
            chip_id: get("CPID"),
            board_id: get("BDID"),
            product_type: get("PRODUCT"),
        }
    }
}

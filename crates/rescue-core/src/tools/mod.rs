//! External tool invocation.

pub mod idevice;
pub mod irecovery;
pub mod process;

use std::path::Path;
use std::time::Duration;

pub use idevice::LibimobiledeviceProvider;
pub use irecovery::{IrecoveryCli, RecoveryIdentity, RecoveryTool};
pub use process::{ExternalTool, ToolError, ToolOutput};

/// Tools the application can make use of.
pub const KNOWN_TOOLS: &[&str] = &[
    "irecovery",
    "idevice_id",
    "ideviceinfo",
    "ideviceenterrecovery",
];

/// Availability of one external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: &'static str,
    pub program: String,
    pub available: bool,
}

/// Probe every known tool in `dir` (or on PATH).
pub fn inventory(dir: Option<&Path>) -> Vec<ToolStatus> {
    KNOWN_TOOLS
        .iter()
        .map(|&name| {
            let tool = ExternalTool::locate(dir, name, Duration::from_secs(5));
            ToolStatus {
                name,
                program: tool.program().display().to_string(),
                available: tool.is_available(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_in_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let tools = inventory(Some(dir.path()));
        assert_eq!(tools.len(), KNOWN_TOOLS.len());
        assert!(tools.iter().all(|t| !t.available));
        assert!(tools[0].program.contains("irecovery"));
    }
}

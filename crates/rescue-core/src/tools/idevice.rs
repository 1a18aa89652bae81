//! libimobiledevice command-line tools as a normal-mode provider.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use super::process::ExternalTool;
use crate::cancel::CancelToken;
use crate::normal::NormalModeProvider;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const ENTER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// `idevice_id`, `ideviceinfo` and `ideviceenterrecovery`.
#[derive(Debug, Clone)]
pub struct LibimobiledeviceProvider {
    idevice_id: ExternalTool,
    ideviceinfo: ExternalTool,
    ideviceenterrecovery: ExternalTool,
}

impl LibimobiledeviceProvider {
    /// Tools inside `dir`, or on PATH.
    pub fn locate(dir: Option<&Path>) -> Self {
        Self {
            idevice_id: ExternalTool::locate(dir, "idevice_id", QUERY_TIMEOUT),
            ideviceinfo: ExternalTool::locate(dir, "ideviceinfo", QUERY_TIMEOUT),
            ideviceenterrecovery: ExternalTool::locate(
                dir,
                "ideviceenterrecovery",
                ENTER_RECOVERY_TIMEOUT,
            ),
        }
    }
}

impl NormalModeProvider for LibimobiledeviceProvider {
    fn list_devices(&self, cancel: &CancelToken) -> Vec<String> {
        match self.idevice_id.run(&["-l"], cancel) {
            Ok(out) if out.success() => parse_udid_list(&out.stdout),
            Ok(out) => {
                debug!(code = out.code, "idevice_id reported no devices");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "idevice_id unavailable");
                Vec::new()
            }
        }
    }

    fn get_value(&self, udid: &str, key: &str, cancel: &CancelToken) -> Option<String> {
        let out = self
            .ideviceinfo
            .run(&["-u", udid, "-k", key], cancel)
            .ok()?;
        if !out.success() {
            return None;
        }
        let value = out.stdout.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn enter_recovery(&self, udid: &str, cancel: &CancelToken) -> bool {
        match self.ideviceenterrecovery.run(&[udid], cancel) {
            Ok(out) if out.success() => true,
            Ok(out) => {
                warn!(code = out.code, detail = %out.detail(), "ideviceenterrecovery failed");
                false
            }
            Err(e) if e.is_cancelled() => {
                debug!("ideviceenterrecovery cancelled");
                false
            }
            Err(e) => {
                warn!(error = %e, "ideviceenterrecovery could not run");
                false
            }
        }
    }
}

fn parse_udid_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        // `idevice_id` may suffix the connection type: "<udid> (USB)".
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udid_list() {
        let text = "00008030-001A2B3C4D5E6F\n\n0123456789abcdef0123456789abcdef01234567 (Network)\n";
        assert_eq!(
            parse_udid_list(text),
            vec![
                "00008030-001A2B3C4D5E6F".to_string(),
                "0123456789abcdef0123456789abcdef01234567".to_string()
            ]
        );
    }

    #[test]
    fn test_missing_tools_degrade_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LibimobiledeviceProvider::locate(Some(dir.path()));
        let cancel = CancelToken::new();
        assert!(provider.list_devices(&cancel).is_empty());
        assert_eq!(provider.get_value("abc", "ProductType", &cancel), None);
        assert!(!provider.enter_recovery("abc", &cancel));
    }

    #[test]
    fn test_cancelled_token_runs_nothing() {
        let provider = LibimobiledeviceProvider::locate(None);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(provider.list_devices(&cancel).is_empty());
        assert!(!provider.enter_recovery("abc", &cancel));
    }
}

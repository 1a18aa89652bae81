//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rescue_core::exit::UnavailableNativeApi;
use rescue_core::state::ManualHandoff;
use rescue_core::tss::{HttpReply, SigningError, SigningTransport};
use rescue_core::{Collaborators, NoNormalMode, UsbBus};
use zip::write::SimpleFileOptions;

pub const RESTORE_PLIST: &[u8] = b"<?xml version=\"1.0\"?><plist><dict>\
    <key>ProductVersion</key><string>15.8</string>\
    <key>ProductBuildVersion</key><string>19H370</string>\
    </dict></plist>";

static SERIAL: Mutex<()> = Mutex::new(());

/// Restore, enter and exit share one process-wide slot; tests that start
/// them take turns.
pub fn exclusive() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write a zip archive with the given entries.
pub fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, data) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Signing service that is never reachable.
pub struct OfflineSigning;

impl SigningTransport for OfflineSigning {
    fn post(&self, _url: &str, _body: String) -> Result<HttpReply, SigningError> {
        Ok(HttpReply {
            status: 503,
            body: String::new(),
        })
    }
}

pub fn collaborators(bus: Arc<dyn UsbBus>) -> Collaborators {
    Collaborators {
        bus,
        normal: Arc::new(NoNormalMode),
        tool: None,
        signing: Arc::new(OfflineSigning),
        native: Arc::new(UnavailableNativeApi),
        handoff: Arc::new(ManualHandoff {
            steps: 2,
            tick: Duration::ZERO,
        }),
    }
}

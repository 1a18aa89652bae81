mod common;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rescue_core::transport::{RecoveryTransport, TransportError, UsbDeviceRecord};
use rescue_core::{
    MockBus, RecordingObserver, RecoveryError, RecoveryEvent, RecoverySession, RestoreConfig,
    RestoreStage, RunStatus, TimingConfig, UsbBus,
};
use tempfile::TempDir;

fn config(dir: &TempDir, archive: &str) -> RestoreConfig {
    RestoreConfig {
        archive: Some(dir.path().join(archive)),
        scratch_root: Some(dir.path().join("scratch")),
        timing: TimingConfig::immediate(),
        ..Default::default()
    }
}

fn scratch_is_empty(dir: &TempDir) -> bool {
    let root = dir.path().join("scratch");
    !root.exists() || std::fs::read_dir(root).unwrap().next().is_none()
}

#[test]
fn test_archive_without_plists_fails_validation() {
    let _serial = common::exclusive();
    let dir = TempDir::new().unwrap();
    common::write_archive(
        &dir.path().join("broken.ipsw"),
        &[
            ("Firmware/dfu/iBSS.n71ap.RELEASE.im4p", b"ibss"),
            ("Firmware/dfu/iBEC.n71ap.RELEASE.im4p", b"ibec"),
        ],
    );

    let bus = MockBus::with_recovery_device("e2e-invalid");
    let observer = Arc::new(RecordingObserver::new());
    let session = RecoverySession::with_observer(
        config(&dir, "broken.ipsw"),
        common::collaborators(Arc::new(bus.clone())),
        observer.clone(),
    );

    let state = session.start_restore().unwrap().join();

    match &state.status {
        RunStatus::Failed { stage, reasons } => {
            assert_eq!(*stage, RestoreStage::ValidateBundle);
            assert_eq!(reasons.len(), 1);
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(state.stage, RestoreStage::ValidateBundle);
    assert_eq!(state.progress, 5);
    assert!(scratch_is_empty(&dir));

    // Nothing after the failing stage ran.
    assert_eq!(bus.stats().opens, 0);
    let events = observer.events();
    assert!(!events.iter().any(|e| matches!(
        e,
        RecoveryEvent::StageStarted {
            stage: RestoreStage::DetectDevice,
            ..
        }
    )));
    assert!(matches!(
        events.last(),
        Some(RecoveryEvent::Failed {
            stage: RestoreStage::ValidateBundle,
            ..
        })
    ));
}

#[test]
fn test_successful_restore_cleans_scratch() {
    let _serial = common::exclusive();
    let dir = TempDir::new().unwrap();
    common::write_archive(
        &dir.path().join("fw.ipsw"),
        &[
            ("BuildManifest.plist", b"<plist/>"),
            ("Restore.plist", common::RESTORE_PLIST),
            ("Firmware/dfu/iBSS.n71ap.RELEASE.im4p", b"ibss"),
            ("Firmware/dfu/iBEC.n71ap.RELEASE.im4p", b"ibec"),
            ("Firmware/all_flash/DeviceTree.n71ap.im4p", b"dtree"),
            ("kernelcache.release.n71", b"kernel"),
        ],
    );

    let bus = MockBus::with_recovery_device("e2e-ok");
    let session = RecoverySession::with_observer(
        config(&dir, "fw.ipsw"),
        common::collaborators(Arc::new(bus.clone())),
        Arc::new(RecordingObserver::new()),
    );

    let state = session.start_restore().unwrap().join();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.progress, 100);
    assert!(scratch_is_empty(&dir));
    let commands = bus.stats().commands();
    assert!(commands.contains(&"devicetree\n".to_string()));
    assert!(commands.contains(&"bootx\n".to_string()));
    assert!(!commands.contains(&"ramdisk\n".to_string()));
}

/// Bus whose first scan blocks until the test lets it through.
struct GatedBus {
    inner: MockBus,
    entered: Mutex<Option<Sender<()>>>,
    release: Mutex<Receiver<()>>,
}

impl UsbBus for GatedBus {
    fn scan(&self) -> Result<Vec<Result<UsbDeviceRecord, TransportError>>, TransportError> {
        if let Some(entered) = self.entered.lock().unwrap().take() {
            entered.send(()).unwrap();
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10));
        }
        self.inner.scan()
    }

    fn open(&self, record: &UsbDeviceRecord) -> Result<Box<dyn RecoveryTransport>, TransportError> {
        self.inner.open(record)
    }
}

#[test]
fn test_second_restore_is_rejected_while_first_runs() {
    let _serial = common::exclusive();
    let dir = TempDir::new().unwrap();
    common::write_archive(
        &dir.path().join("fw.ipsw"),
        &[("Restore.plist", common::RESTORE_PLIST)],
    );

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let bus = GatedBus {
        inner: MockBus::new(),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    };
    let session = RecoverySession::with_observer(
        config(&dir, "fw.ipsw"),
        common::collaborators(Arc::new(bus)),
        Arc::new(RecordingObserver::new()),
    );

    let first = session.start_restore().unwrap();
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let before = first.status();
    assert_eq!(before.stage, RestoreStage::DetectDevice);
    assert_eq!(before.status, RunStatus::Running);
    assert!(session.is_busy());

    assert!(matches!(session.start_restore(), Err(RecoveryError::Busy)));
    assert_eq!(first.status(), before);

    release_tx.send(()).unwrap();
    let state = first.join();
    assert!(matches!(
        state.status,
        RunStatus::Failed {
            stage: RestoreStage::DetectDevice,
            ..
        }
    ));

    // The slot is free again.
    assert!(!session.is_busy());
    session.start_restore().unwrap().join();
}

#[test]
fn test_cancel_before_start_stops_at_first_stage() {
    let _serial = common::exclusive();
    let dir = TempDir::new().unwrap();
    common::write_archive(
        &dir.path().join("fw.ipsw"),
        &[("Restore.plist", common::RESTORE_PLIST)],
    );

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let bus = GatedBus {
        inner: MockBus::with_recovery_device("e2e-cancel"),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    };
    let session = RecoverySession::with_observer(
        config(&dir, "fw.ipsw"),
        common::collaborators(Arc::new(bus)),
        Arc::new(RecordingObserver::new()),
    );

    let run = session.start_restore().unwrap();
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    run.cancel();
    release_tx.send(()).unwrap();

    let state = run.join();
    assert!(matches!(state.status, RunStatus::Cancelled { .. }));
    assert!(state.progress < 100);
    assert!(scratch_is_empty(&dir));
}

mod common;

use std::time::Duration;

use rescue_core::state::{DeviceFlashBackend, FlashSequencer, load_ramdisk_and_kernel};
use rescue_core::{
    BundleReader, CancelToken, ClientSettings, Component, MockBus, PollPolicy, SigningOutcome,
};
use tempfile::TempDir;

fn unsigned() -> SigningOutcome {
    SigningOutcome::Unsigned {
        reason: "signing server unreachable".into(),
    }
}

#[test]
fn test_flash_then_boot_commands_over_usb_client() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("fw.ipsw");
    common::write_archive(
        &archive,
        &[
            ("Restore.plist", common::RESTORE_PLIST),
            ("Firmware/dfu/iBSS.n61ap.RELEASE.im4p", b"ibss"),
            ("Firmware/dfu/iBEC.n61ap.RELEASE.im4p", b"ibec"),
            ("Firmware/all_flash/DeviceTree.n61ap.im4p", b"dt"),
            ("038-1111-001.dmg", b"rd"),
            ("Firmware/038-1111-001.RestoreRamDisk.im4p", b"ramdisk"),
            ("kernelcache.release.n61", b"kc"),
        ],
    );
    let bundle = BundleReader::with_scratch_root(dir.path().join("scratch"))
        .extract(&archive, "n61ap")
        .unwrap();

    let bus = MockBus::with_recovery_device("it-ramdisk");
    let cancel = CancelToken::new();
    let mut backend = DeviceFlashBackend::new(&bus, None, ClientSettings::immediate(), cancel);

    let sequencer = FlashSequencer {
        verify: PollPolicy::new(1, Duration::ZERO),
        settle: Duration::ZERO,
    };
    sequencer
        .flash(
            &mut backend,
            bundle.require_path(Component::Ibss).unwrap(),
            bundle.require_path(Component::Ibec).unwrap(),
            &unsigned(),
        )
        .unwrap();

    let report =
        load_ramdisk_and_kernel(&mut backend, &bundle, &unsigned(), Duration::ZERO).unwrap();
    assert_eq!(
        report.loaded,
        vec![
            Component::DeviceTree,
            Component::RestoreRamDisk,
            Component::KernelCache
        ]
    );
    assert!(report.notes.is_empty());

    let writes: Vec<Vec<u8>> = bus
        .stats()
        .bulk_writes
        .into_iter()
        .map(|(_, data)| data)
        .collect();
    let expected: Vec<&[u8]> = vec![
        &b"ibss"[..],
        &b"ibec"[..],
        &b"dt"[..],
        &b"devicetree\n"[..],
        &b"ramdisk"[..],
        &b"ramdisk\n"[..],
        &b"kc"[..],
        &b"bootx\n"[..],
    ];
    assert_eq!(writes, expected);
    assert_eq!(bus.stats().open_handles(), 0);

    bundle.cleanup();
}

#[test]
fn test_cancelled_backend_stops_loading() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("fw.ipsw");
    common::write_archive(
        &archive,
        &[
            ("iBSS.n61ap.im4p", b"ibss"),
            ("iBEC.n61ap.im4p", b"ibec"),
            ("DeviceTree.n61ap.im4p", b"dt"),
        ],
    );
    let bundle = BundleReader::with_scratch_root(dir.path().join("scratch"))
        .extract(&archive, "n61ap")
        .unwrap();

    let bus = MockBus::with_recovery_device("it-ramdisk-cancel");
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut backend = DeviceFlashBackend::new(&bus, None, ClientSettings::immediate(), cancel);

    let result = load_ramdisk_and_kernel(&mut backend, &bundle, &unsigned(), Duration::ZERO);
    assert!(result.is_err());
    assert!(bus.stats().bulk_writes.is_empty());
    bundle.cleanup();
}

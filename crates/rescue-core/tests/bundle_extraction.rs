mod common;

use std::io::Write;
use std::path::Path;

use rescue_core::bundle::ComponentData;
use rescue_core::{BundleReader, Component};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const ROOTFS_SIZE: u64 = 500 * 1024 * 1024;
const CHUNK: usize = 1024 * 1024;

/// IPSW-shaped archive with a 500 MB zero-filled root filesystem image.
fn build_large_archive(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("large.ipsw");
    let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, data) in [
        ("Restore.plist", common::RESTORE_PLIST),
        ("BuildManifest.plist", b"<plist/>".as_slice()),
        ("Firmware/dfu/iBSS.productX.RELEASE.im4p", b"IBSS-PAYLOAD".as_slice()),
        ("Firmware/dfu/iBEC.productX.RELEASE.im4p", b"IBEC-PAYLOAD".as_slice()),
        ("Firmware/dfu/iBSS.otherY.RELEASE.im4p", b"WRONG-IBSS".as_slice()),
        ("RestoreRamdisk.dmg", b"ramdisk".as_slice()),
    ] {
        zip.start_file(name, options).unwrap();
        zip.write_all(data).unwrap();
    }

    zip.start_file("018-12345-001.dmg", options).unwrap();
    let zeros = vec![0u8; CHUNK];
    for _ in 0..(ROOTFS_SIZE as usize / CHUNK) {
        zip.write_all(&zeros).unwrap();
    }
    zip.finish().unwrap();
    path
}

/// Total size of the regular files below `dir`.
fn file_bytes(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            let meta = entry.metadata().unwrap();
            if meta.is_dir() {
                file_bytes(&entry.path())
            } else {
                meta.len()
            }
        })
        .sum()
}

#[test]
fn test_locates_bootloaders_and_defers_root_filesystem() {
    let dir = TempDir::new().unwrap();
    let archive = build_large_archive(&dir);
    let scratch_root = dir.path().join("scratch");

    let bundle = BundleReader::with_scratch_root(&scratch_root)
        .extract(&archive, "productX")
        .unwrap();

    let ibss = bundle.get(Component::Ibss).unwrap();
    assert_eq!(ibss.bytes(), Some(b"IBSS-PAYLOAD".as_slice()));
    let ibec = bundle.get(Component::Ibec).unwrap();
    assert_eq!(ibec.bytes(), Some(b"IBEC-PAYLOAD".as_slice()));
    assert_eq!(
        std::fs::read(bundle.require_path(Component::Ibss).unwrap()).unwrap(),
        b"IBSS-PAYLOAD"
    );

    match bundle.get(Component::SystemImage) {
        Some(ComponentData::Deferred { entry, size }) => {
            assert_eq!(entry, "018-12345-001.dmg");
            assert_eq!(*size, ROOTFS_SIZE);
        }
        other => panic!("root filesystem not deferred: {other:?}"),
    }

    // Only the small components were written out.
    let written = file_bytes(bundle.scratch_dir());
    assert!(written < 1024 * 1024, "scratch holds {written} bytes");

    let scratch = bundle.scratch_dir().to_path_buf();
    bundle.cleanup();
    assert!(!scratch.exists());
    assert_eq!(std::fs::read_dir(&scratch_root).unwrap().count(), 0);
}

#[test]
fn test_missing_optional_components_are_not_errors() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("min.ipsw");
    common::write_archive(
        &archive,
        &[
            ("Restore.plist", common::RESTORE_PLIST),
            ("iBSS.j72ap.im4p", b"a"),
            ("iBEC.j72ap.im4p", b"b"),
        ],
    );

    let bundle = BundleReader::with_scratch_root(dir.path().join("scratch"))
        .extract(&archive, "iPad7,5")
        .unwrap();

    assert!(bundle.contains(Component::Ibss));
    assert!(bundle.contains(Component::Ibec));
    assert!(!bundle.contains(Component::RestoreRamDisk));
    assert!(!bundle.contains(Component::KernelCache));
    assert!(!bundle.contains(Component::SystemImage));
    bundle.cleanup();
}

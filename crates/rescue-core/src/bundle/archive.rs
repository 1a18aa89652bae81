//! IPSW (zip) archive access and validation.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};
use zip::ZipArchive;

use super::BundleError;

pub const BUILD_MANIFEST: &str = "BuildManifest.plist";
pub const RESTORE_PLIST: &str = "Restore.plist";

/// Version metadata of a firmware archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpswInfo {
    pub version: String,
    pub build: String,
}

impl IpswInfo {
    pub const UNKNOWN: &'static str = "Unknown";
}

/// Name and uncompressed size of one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// An opened firmware archive.
pub struct IpswArchive {
    path: PathBuf,
    zip: ZipArchive<BufReader<File>>,
}

impl IpswArchive {
    #[instrument(level = "debug")]
    pub fn open(path: &Path) -> Result<Self, BundleError> {
        let file = File::open(path).map_err(|source| BundleError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let zip = ZipArchive::new(BufReader::new(file))?;
        info!(archive = %path.display(), entries = zip.len(), "Opened IPSW");
        Ok(Self {
            path: path.to_path_buf(),
            zip,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.zip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zip.len() == 0
    }

    /// Entry metadata from the central directory; no entry data is read.
    pub fn entries(&mut self) -> Result<Vec<EntryMeta>, BundleError> {
        let mut out = Vec::with_capacity(self.zip.len());
        for index in 0..self.zip.len() {
            let entry = self.zip.by_index_raw(index)?;
            out.push(EntryMeta {
                index,
                name: entry.name().to_string(),
                size: entry.size(),
                is_dir: entry.is_dir(),
            });
        }
        Ok(out)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.zip.index_for_name(name).is_some()
    }

    /// Decompress one entry into memory.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, BundleError> {
        let mut entry = self.zip.by_name(name)?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// The entry's path with `..` and absolute prefixes rejected; `None`
    /// when the name would land outside any directory it is joined to.
    pub fn enclosed_path(&mut self, name: &str) -> Result<Option<PathBuf>, BundleError> {
        Ok(self.zip.by_name(name)?.enclosed_name())
    }

    /// Stream one entry into `out`; returns the byte count.
    pub fn copy_entry(&mut self, name: &str, out: &mut impl io::Write) -> Result<u64, BundleError> {
        let mut entry = self.zip.by_name(name)?;
        Ok(io::copy(&mut entry, out)?)
    }

    /// Confirm the archive is a firmware bundle and read its version.
    ///
    /// At least one of `Restore.plist` and `BuildManifest.plist` must exist.
    pub fn validate(&mut self) -> Result<IpswInfo, BundleError> {
        let has_restore = self.contains(RESTORE_PLIST);
        let has_manifest = self.contains(BUILD_MANIFEST);
        if !has_restore && !has_manifest {
            return Err(BundleError::MissingManifests);
        }

        let source = if has_restore { RESTORE_PLIST } else { BUILD_MANIFEST };
        let text = String::from_utf8_lossy(&self.read_entry(source)?).into_owned();
        let info = IpswInfo {
            version: plist_string_value(&text, "ProductVersion")
                .unwrap_or_else(|| IpswInfo::UNKNOWN.into()),
            build: plist_string_value(&text, "ProductBuildVersion")
                .unwrap_or_else(|| IpswInfo::UNKNOWN.into()),
        };
        debug!(source, version = %info.version, build = %info.build, "IPSW validated");
        Ok(info)
    }
}

/// The `<string>` following `<key>{key}</key>` in an XML plist.
///
/// Plain substring search; the document is not parsed.
pub fn plist_string_value(text: &str, key: &str) -> Option<String> {
    const OPEN: &str = "<string>";
    const CLOSE: &str = "</string>";

    let key_at = text.find(&format!("<key>{key}</key>"))?;
    let start = key_at + text[key_at..].find(OPEN)? + OPEN.len();
    let len = text[start..].find(CLOSE)?;
    Some(text[start..start + len].to_string())
}

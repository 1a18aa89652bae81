//! Firmware bundle reader.
//!
//! Turns an IPSW archive into a [`FirmwareBundle`]: small components are
//! extracted to a private scratch directory and held in memory, the root
//! filesystem image is only located. The scratch directory lives exactly as
//! long as the bundle.

pub mod archive;
pub mod component;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tempfile::TempDir;
use tracing::{info, instrument, warn};

pub use archive::{EntryMeta, IpswArchive, IpswInfo};
pub use component::Component;

/// Prefix of scratch directories created under the scratch root.
pub const SCRATCH_PREFIX: &str = "irescue_restore_";

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a firmware archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Missing required plist files (Restore.plist, BuildManifest.plist)")]
    MissingManifests,

    #[error("Entry {0} points outside the archive root")]
    UnsafeEntry(String),

    #[error("Component {component} not found")]
    MissingComponent { component: Component, required: bool },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentData {
    /// Extracted to the scratch directory and loaded.
    Extracted {
        entry: String,
        path: PathBuf,
        bytes: Vec<u8>,
    },
    /// Located in the archive but never read.
    Deferred { entry: String, size: u64 },
}

impl ComponentData {
    pub fn entry(&self) -> &str {
        match self {
            ComponentData::Extracted { entry, .. } | ComponentData::Deferred { entry, .. } => entry,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ComponentData::Extracted { bytes, .. } => Some(bytes),
            ComponentData::Deferred { .. } => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            ComponentData::Extracted { path, .. } => Some(path),
            ComponentData::Deferred { .. } => None,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            ComponentData::Extracted { bytes, .. } => bytes.len() as u64,
            ComponentData::Deferred { size, .. } => *size,
        }
    }
}

/// Firmware components of one restore run, plus their scratch storage.
#[derive(Debug)]
pub struct FirmwareBundle {
    archive: PathBuf,
    components: BTreeMap<Component, ComponentData>,
    scratch: TempDir,
}

impl FirmwareBundle {
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn get(&self, component: Component) -> Option<&ComponentData> {
        self.components.get(&component)
    }

    pub fn contains(&self, component: Component) -> bool {
        self.components.contains_key(&component)
    }

    pub fn components(&self) -> impl Iterator<Item = (Component, &ComponentData)> {
        self.components.iter().map(|(c, d)| (*c, d))
    }

    /// Path of an extracted component, or [`BundleError::MissingComponent`].
    pub fn require_path(&self, component: Component) -> Result<&Path, BundleError> {
        self.get(component)
            .and_then(ComponentData::path)
            .ok_or(BundleError::MissingComponent {
                component,
                required: component.is_required(),
            })
    }

    /// Delete the scratch directory.
    pub fn cleanup(self) {
        let path = self.scratch.path().to_path_buf();
        match self.scratch.close() {
            Ok(()) => info!(path = %path.display(), "Cleaned up temporary files"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not clean up temp files"),
        }
    }
}

/// Extracts firmware bundles from IPSW archives.
#[derive(Debug, Clone, Default)]
pub struct BundleReader {
    scratch_root: Option<PathBuf>,
}

impl BundleReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
        }
    }

    fn scratch(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    /// Extract every known component for `product_type`.
    ///
    /// Missing optional components are logged; missing `iBSS`/`iBEC` are
    /// left for the caller to reject via [`FirmwareBundle::require_path`].
    #[instrument(skip(self), fields(archive = %archive_path.display()))]
    pub fn extract(
        &self,
        archive_path: &Path,
        product_type: &str,
    ) -> Result<FirmwareBundle, BundleError> {
        let mut archive = IpswArchive::open(archive_path)?;
        let scratch = self.scratch()?;
        info!(path = %scratch.path().display(), "Extract path");

        let entries = archive.entries()?;
        let names: Vec<&str> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name.as_str())
            .collect();

        let mut components = BTreeMap::new();

        for (component, name) in [
            (Component::BuildManifest, archive::BUILD_MANIFEST),
            (Component::Restore, archive::RESTORE_PLIST),
        ] {
            if archive.contains(name) {
                let data = extract_entry(&mut archive, name, scratch.path())?;
                info!(component = %component, kb = data.size() / 1024, "Extracted");
                components.insert(component, data);
            } else {
                warn!(component = %component, "Not found");
            }
        }

        for component in Component::PATTERN_MATCHED {
            let found = component
                .search_tokens()
                .iter()
                .find_map(|token| component::match_entry(&names, token, product_type));

            match found {
                Some(name) => {
                    let data = extract_entry(&mut archive, name, scratch.path())?;
                    info!(component = %component, entry = name, kb = data.size() / 1024, "Found");
                    components.insert(component, data);
                }
                None if component.is_required() => {
                    warn!(component = %component, "Not found");
                }
                None => info!(component = %component, "Not present (not required for this restore method)"),
            }
        }

        match find_root_filesystem(&entries) {
            Some(meta) => {
                info!(entry = %meta.name, mb = meta.size / (1024 * 1024), "Root filesystem located");
                components.insert(
                    Component::SystemImage,
                    ComponentData::Deferred {
                        entry: meta.name.clone(),
                        size: meta.size,
                    },
                );
            }
            None => warn!("No root filesystem image found"),
        }

        info!(count = components.len(), "Firmware components ready");
        Ok(FirmwareBundle {
            archive: archive_path.to_path_buf(),
            components,
            scratch,
        })
    }
}

fn extract_entry(
    archive: &mut IpswArchive,
    name: &str,
    dir: &Path,
) -> Result<ComponentData, BundleError> {
    let relative = archive
        .enclosed_path(name)?
        .ok_or_else(|| BundleError::UnsafeEntry(name.to_string()))?;
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    {
        let mut out = BufWriter::new(File::create(&path)?);
        archive.copy_entry(name, &mut out)?;
        std::io::Write::flush(&mut out)?;
    }
    let bytes = std::fs::read(&path)?;

    Ok(ComponentData::Extracted {
        entry: name.to_string(),
        path,
        bytes,
    })
}

/// Largest `.dmg` that is neither a ramdisk nor an update image, by size
/// metadata alone.
pub fn find_root_filesystem(entries: &[EntryMeta]) -> Option<&EntryMeta> {
    entries
        .iter()
        .filter(|e| !e.is_dir)
        .filter(|e| {
            let name = e.name.to_ascii_lowercase();
            name.ends_with(".dmg") && !name.contains("ramdisk") && !name.contains("update")
        })
        .fold(None, |best: Option<&EntryMeta>, e| match best {
            Some(b) if b.size >= e.size => Some(b),
            _ => Some(e),
        })
}

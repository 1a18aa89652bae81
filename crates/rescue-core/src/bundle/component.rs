//! Logical firmware components of an IPSW.

use std::fmt;

/// One named piece of a firmware bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    BuildManifest,
    Restore,
    Ibss,
    Ibec,
    DeviceTree,
    KernelCache,
    RestoreRamDisk,
    RestoreLogo,
    SystemImage,
}

impl Component {
    /// Components located by name pattern, in extraction order.
    pub const PATTERN_MATCHED: [Component; 6] = [
        Component::Ibss,
        Component::Ibec,
        Component::DeviceTree,
        Component::KernelCache,
        Component::RestoreRamDisk,
        Component::RestoreLogo,
    ];

    /// Canonical name, also used as the signing request key.
    pub const fn name(self) -> &'static str {
        match self {
            Component::BuildManifest => "BuildManifest",
            Component::Restore => "Restore",
            Component::Ibss => "iBSS",
            Component::Ibec => "iBEC",
            Component::DeviceTree => "DeviceTree",
            Component::KernelCache => "KernelCache",
            Component::RestoreRamDisk => "RestoreRamDisk",
            Component::RestoreLogo => "RestoreLogo",
            Component::SystemImage => "SystemImage",
        }
    }

    /// Tokens searched for in archive entry names, most specific first.
    pub const fn search_tokens(self) -> &'static [&'static str] {
        match self {
            Component::Ibss => &["iBSS"],
            Component::Ibec => &["iBEC"],
            Component::DeviceTree => &["DeviceTree"],
            Component::KernelCache => &["kernelcache"],
            Component::RestoreRamDisk => &["RestoreRamDisk", "ramdisk"],
            Component::RestoreLogo => &["RestoreLogo", "applelogo"],
            Component::BuildManifest => &["BuildManifest.plist"],
            Component::Restore => &["Restore.plist"],
            Component::SystemImage => &[],
        }
    }

    /// A restore cannot proceed without these.
    pub const fn is_required(self) -> bool {
        matches!(self, Component::Ibss | Component::Ibec)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the entry for `token` among `names`.
///
/// Preference order: `{token}.{product}`, then `{token}.` followed later by
/// the product, then the bare token. Matching is case-insensitive and
/// directories are ignored. Ties go to the first entry in archive order.
pub fn match_entry<'a>(names: &[&'a str], token: &str, product_type: &str) -> Option<&'a str> {
    let token = token.to_ascii_lowercase();
    let product = product_type.to_ascii_lowercase();
    let exact = format!("{token}.{product}");
    let lowered: Vec<(usize, String)> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| !n.ends_with('/'))
        .map(|(i, n)| (i, n.to_ascii_lowercase()))
        .collect();

    let pick = |pred: &dyn Fn(&str) -> bool| {
        lowered
            .iter()
            .find(|(_, name)| pred(name))
            .map(|(i, _)| names[*i])
    };

    let has_product = !product.is_empty();
    let loose = |name: &str| {
        name.find(&format!("{token}."))
            .is_some_and(|at| name[at + token.len()..].contains(&product))
    };

    (has_product.then(|| pick(&|n: &str| n.contains(&exact))).flatten())
        .or_else(|| has_product.then(|| pick(&loose)).flatten())
        .or_else(|| pick(&|n: &str| n.contains(&token)))
}

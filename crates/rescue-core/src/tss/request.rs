//! Signing request construction.

use std::collections::BTreeMap;

use plist::{Dictionary, Value};
use sha1::{Digest, Sha1};

use super::SigningError;
use crate::bundle::{Component, FirmwareBundle};

/// Device identifiers plus one SHA-1 digest per firmware component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningRequest {
    pub ecid: String,
    pub chip_id: String,
    pub board_id: String,
    pub product_type: String,
    pub build: String,
    pub digests: BTreeMap<String, Vec<u8>>,
}

impl SigningRequest {
    pub fn new(ecid: impl Into<String>) -> Self {
        Self {
            ecid: ecid.into(),
            ..Default::default()
        }
    }

    pub fn add_component(&mut self, name: &str, data: &[u8]) {
        self.digests
            .insert(name.to_string(), Sha1::digest(data).to_vec());
    }

    /// Digest every extracted bootloader/kernel component of `bundle`.
    pub fn add_bundle(&mut self, bundle: &FirmwareBundle) {
        for (component, data) in bundle.components() {
            if matches!(component, Component::BuildManifest | Component::Restore) {
                continue;
            }
            if let Some(bytes) = data.bytes() {
                self.add_component(component.name(), bytes);
            }
        }
    }

    /// A usable ECID is present and non-zero.
    pub fn has_device_identity(&self) -> bool {
        parse_identifier(&self.ecid).is_some_and(|ecid| ecid != 0)
    }

    /// Serialize as an XML property list.
    pub fn to_plist_xml(&self) -> Result<String, SigningError> {
        let mut dict = Dictionary::new();
        dict.insert("ApECID".into(), id_value(&self.ecid));
        dict.insert("ApChipID".into(), id_value(&self.chip_id));
        dict.insert("ApBoardID".into(), id_value(&self.board_id));
        dict.insert("ApProductionMode".into(), Value::Boolean(true));
        dict.insert("ApSecurityMode".into(), Value::Boolean(true));
        dict.insert("@BBTicket".into(), Value::Boolean(true));
        dict.insert(
            "@HostPlatformInfo".into(),
            Value::String(std::env::consts::OS.to_string()),
        );

        for (name, digest) in &self.digests {
            let mut entry = Dictionary::new();
            entry.insert("Digest".into(), Value::Data(digest.clone()));
            dict.insert(name.clone(), Value::Dictionary(entry));
        }

        let mut buf = Vec::new();
        Value::Dictionary(dict)
            .to_writer_xml(&mut buf)
            .map_err(|e| SigningError::Encode(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| SigningError::Encode(e.to_string()))
    }
}

/// Decimal or `0x`-prefixed hexadecimal identifier.
pub fn parse_identifier(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn id_value(text: &str) -> Value {
    Value::from(parse_identifier(text).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identifier() {
        assert_eq!(parse_identifier("6008090422530094"), Some(6008090422530094));
        assert_eq!(parse_identifier("0x8015"), Some(0x8015));
        assert_eq!(parse_identifier(" 0X0e "), Some(0x0e));
        assert_eq!(parse_identifier(""), None);
        assert_eq!(parse_identifier("garbage"), None);
    }

    #[test]
    fn test_device_identity() {
        assert!(!SigningRequest::new("").has_device_identity());
        assert!(!SigningRequest::new("0").has_device_identity());
        assert!(!SigningRequest::new("0x0").has_device_identity());
        assert!(SigningRequest::new("0x1A2B").has_device_identity());
    }

    #[test]
    fn test_plist_shape() {
        let mut request = SigningRequest::new("0x10");
        request.chip_id = "32789".into();
        request.board_id = "0x0e".into();
        request.add_component("iBSS", b"abc");

        let xml = request.to_plist_xml().unwrap();
        assert!(xml.contains("<key>ApECID</key>"));
        assert!(xml.contains("<integer>16</integer>"));
        assert!(xml.contains("<integer>14</integer>"));
        assert!(xml.contains("<key>@BBTicket</key>"));
        assert!(xml.contains("<key>iBSS</key>"));
        assert!(xml.contains("<key>Digest</key>"));
        // base64(sha1("abc"))
        assert!(xml.contains("qZk+NkcGgWq6PiVxeFDCbJzQ2J0="));
    }
}

//! Signing response interpretation.
//!
//! The service answers either with a bare XML plist or with a form-encoded
//! envelope (`STATUS=0&MESSAGE=SUCCESS&REQUEST_STRING=<plist>`). Blobs are
//! collected with a tolerant tag scanner so one malformed entry does not
//! discard the others.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

/// What the service said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved(BTreeMap<String, Vec<u8>>),
    NotEligible,
    Rejected(String),
}

pub fn interpret(body: &str) -> Verdict {
    if is_success(body) {
        return Verdict::Approved(scan_blobs(payload(body)));
    }
    if body.contains("isn't eligible") || body.contains("not eligible") {
        return Verdict::NotEligible;
    }
    Verdict::Rejected(envelope_field(body, "MESSAGE").unwrap_or_else(|| "no SUCCESS marker".into()))
}

fn is_success(body: &str) -> bool {
    let plist_marker = body.contains("<key>MESSAGE</key>") && body.contains("<string>SUCCESS</string>");
    plist_marker || envelope_field(body, "MESSAGE").as_deref() == Some("SUCCESS")
}

fn envelope_field(body: &str, name: &str) -> Option<String> {
    let head = body.split("REQUEST_STRING=").next().unwrap_or(body);
    head.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_string())
    })
}

fn payload(body: &str) -> &str {
    body.split_once("REQUEST_STRING=")
        .map(|(_, rest)| rest)
        .unwrap_or(body)
}

/// Collect `<key>name</key><data>base64</data>` pairs.
///
/// A `Blob` entry inside a dict is named after the dict's key. Entries whose
/// data does not decode are skipped.
pub fn scan_blobs(xml: &str) -> BTreeMap<String, Vec<u8>> {
    let mut blobs = BTreeMap::new();
    let mut owners: Vec<Option<String>> = Vec::new();
    let mut last_key: Option<String> = None;
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        rest = &rest[open..];
        let Some(close) = rest.find('>') else { break };
        let tag = &rest[1..close];
        let after = &rest[close + 1..];

        match tag {
            "key" => {
                let Some(end) = after.find("</key>") else { break };
                last_key = Some(after[..end].trim().to_string());
                rest = &after[end + "</key>".len()..];
                continue;
            }
            "data" => {
                let Some(end) = after.find("</data>") else { break };
                if let Some(key) = last_key.take() {
                    let name = match owners.last() {
                        Some(Some(owner)) if key == "Blob" => owner.clone(),
                        _ => key,
                    };
                    let encoded: String = after[..end].split_whitespace().collect();
                    match STANDARD.decode(encoded.as_bytes()) {
                        Ok(bytes) if !bytes.is_empty() => {
                            debug!(name = %name, bytes = bytes.len(), "Signed blob");
                            blobs.insert(name, bytes);
                        }
                        Ok(_) => {}
                        Err(e) => debug!(name = %name, error = %e, "Skipping invalid blob data"),
                    }
                }
                rest = &after[end + "</data>".len()..];
                continue;
            }
            "dict" => owners.push(last_key.take()),
            "/dict" => {
                owners.pop();
                last_key = None;
            }
            t if t.starts_with('?') || t.starts_with('!') || t.starts_with("plist") || t == "/plist" => {}
            _ => last_key = None,
        }
        rest = after;
    }

    blobs
}

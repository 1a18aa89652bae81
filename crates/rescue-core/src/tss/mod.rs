//! Signing negotiation (TSS).
//!
//! Best effort by construction: every failure path ends in
//! [`SigningOutcome::Unsigned`], never in an error.

pub mod request;
pub mod response;
pub mod transport;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

pub use request::SigningRequest;
pub use transport::{DEFAULT_SIGNING_URL, HttpReply, ReqwestTransport, SigningTransport};

use response::Verdict;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Could not encode request: {0}")]
    Encode(String),
}

/// Result of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    /// Component name to signed blob.
    Signed(BTreeMap<String, Vec<u8>>),
    /// Continue with unsigned components.
    Unsigned { reason: String },
}

impl SigningOutcome {
    pub fn is_signed(&self) -> bool {
        matches!(self, SigningOutcome::Signed(_))
    }

    fn unsigned(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(reason = %reason, "Continuing without signed blobs");
        SigningOutcome::Unsigned { reason }
    }
}

/// Talks to the signing service.
pub struct SigningNegotiator {
    transport: Box<dyn SigningTransport>,
    url: String,
}

impl SigningNegotiator {
    pub fn new(transport: Box<dyn SigningTransport>) -> Self {
        Self::with_url(transport, DEFAULT_SIGNING_URL)
    }

    pub fn with_url(transport: Box<dyn SigningTransport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
        }
    }

    pub fn negotiate(&self, request: &SigningRequest) -> SigningOutcome {
        info!(
            product = %request.product_type,
            ecid = %request.ecid,
            build = %request.build,
            components = request.digests.len(),
            "Contacting signing server"
        );

        if !request.has_device_identity() {
            return SigningOutcome::unsigned("invalid ECID: device identifiers unavailable");
        }

        let body = match request.to_plist_xml() {
            Ok(body) => body,
            Err(e) => return SigningOutcome::unsigned(e.to_string()),
        };

        let reply = match self.transport.post(&self.url, body) {
            Ok(reply) => reply,
            Err(e) => return SigningOutcome::unsigned(format!("network error: {e}")),
        };

        if !reply.is_success() {
            return SigningOutcome::unsigned(format!("server returned status {}", reply.status));
        }

        match response::interpret(&reply.body) {
            Verdict::Approved(blobs) => {
                info!(count = blobs.len(), "Signing server approved the request");
                SigningOutcome::Signed(blobs)
            }
            Verdict::NotEligible => {
                SigningOutcome::unsigned("device not eligible for this build (no longer signed)")
            }
            Verdict::Rejected(message) => {
                SigningOutcome::unsigned(format!("request not approved: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        calls: Arc<AtomicUsize>,
        reply: fn() -> Result<HttpReply, SigningError>,
    }

    impl SigningTransport for CountingTransport {
        fn post(&self, _url: &str, _body: String) -> Result<HttpReply, SigningError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)()
        }
    }

    fn negotiator(reply: fn() -> Result<HttpReply, SigningError>) -> (SigningNegotiator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = CountingTransport {
            calls: calls.clone(),
            reply,
        };
        (SigningNegotiator::new(Box::new(transport)), calls)
    }

    fn ok_body(body: &'static str) -> Result<HttpReply, SigningError> {
        Ok(HttpReply {
            status: 200,
            body: body.into(),
        })
    }

    #[test]
    fn test_missing_ecid_skips_network() {
        let (negotiator, calls) = negotiator(|| ok_body("MESSAGE=SUCCESS"));
        for ecid in ["", "0"] {
            let outcome = negotiator.negotiate(&SigningRequest::new(ecid));
            assert!(matches!(outcome, SigningOutcome::Unsigned { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_http_error_status_is_unsigned() {
        let (negotiator, calls) = negotiator(|| {
            Ok(HttpReply {
                status: 503,
                body: String::new(),
            })
        });
        let outcome = negotiator.negotiate(&SigningRequest::new("0x1234"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match outcome {
            SigningOutcome::Unsigned { reason } => assert!(reason.contains("503")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_transport_error_is_unsigned() {
        let (negotiator, calls) = negotiator(|| {
            let invalid = reqwest::blocking::Client::new().get("not a url").build();
            Err(SigningError::Http(invalid.unwrap_err()))
        });
        match negotiator.negotiate(&SigningRequest::new("42")) {
            SigningOutcome::Unsigned { reason } => assert!(reason.starts_with("network error")),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_eligible_is_unsigned() {
        let (negotiator, _) = negotiator(|| ok_body("STATUS=94&MESSAGE=This device isn't eligible"));
        let outcome = negotiator.negotiate(&SigningRequest::new("42"));
        assert!(matches!(outcome, SigningOutcome::Unsigned { reason } if reason.contains("not eligible")));
    }

    #[test]
    fn test_success_returns_blobs() {
        let (negotiator, _) = negotiator(|| {
            ok_body("STATUS=0&MESSAGE=SUCCESS&REQUEST_STRING=<plist><dict><key>iBSS</key><data>AQID</data></dict></plist>")
        });
        let mut request = SigningRequest::new("42");
        request.add_component("iBSS", b"payload");
        match negotiator.negotiate(&request) {
            SigningOutcome::Signed(blobs) => assert_eq!(blobs["iBSS"], vec![1, 2, 3]),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

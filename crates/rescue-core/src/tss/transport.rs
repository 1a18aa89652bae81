//! HTTP transport to the signing service.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::instrument;

use super::SigningError;

pub const DEFAULT_SIGNING_URL: &str = "https://gs.apple.com/TSS/controller?action=2";
pub const SIGNING_TIMEOUT: Duration = Duration::from_secs(30);

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// POSTs a request document to the signing service.
pub trait SigningTransport: Send + Sync {
    fn post(&self, url: &str, body: String) -> Result<HttpReply, SigningError>;
}

impl<T: SigningTransport + ?Sized> SigningTransport for std::sync::Arc<T> {
    fn post(&self, url: &str, body: String) -> Result<HttpReply, SigningError> {
        (**self).post(url, body)
    }
}

/// Blocking `reqwest` client over rustls, TLS 1.2 minimum.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, SigningError> {
        Self::with_timeout(SIGNING_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, SigningError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("irescue/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()?;
        Ok(Self { client })
    }
}

impl SigningTransport for ReqwestTransport {
    #[instrument(level = "debug", skip(self, body), fields(len = body.len()))]
    fn post(&self, url: &str, body: String) -> Result<HttpReply, SigningError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .body(body)
            .send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(HttpReply { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_success_range() {
        let reply = |status| HttpReply {
            status,
            body: String::new(),
        };
        assert!(reply(200).is_success());
        assert!(reply(204).is_success());
        assert!(!reply(301).is_success());
        assert!(!reply(500).is_success());
    }

    #[test]
    fn test_client_builds() {
        assert!(ReqwestTransport::new().is_ok());
    }
}

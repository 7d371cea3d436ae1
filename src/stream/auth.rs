//! OAuth 1.0a request signing (HMAC-SHA1).
//!
//! Every stream request carries an `Authorization: OAuth ...` header computed
//! over the method, the normalized URL and all query and form parameters,
//! with a fresh nonce and timestamp per request.

#![allow(missing_docs)]

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use reqwest::Url;
use sha1::Sha1;

use crate::core::config::CredentialsConfig;
use crate::core::errors::{Result, TwsError};

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
pub const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const NONCE_LEN: usize = 32;

/// Percent-encode a string per RFC 3986.
pub fn percent_encode(raw: &str) -> String {
    utf8_percent_encode(raw, RFC3986).to_string()
}

/// Signs requests with consumer and access-token credentials.
#[derive(Clone)]
pub struct OAuthSigner {
    consumer_key: String,
    consumer_secret: String,
    token: String,
    token_secret: String,
}

impl fmt::Debug for OAuthSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSigner")
            .field("consumer_key", &self.consumer_key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl OAuthSigner {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        token: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            token: token.into(),
            token_secret: token_secret.into(),
        }
    }

    pub fn from_credentials(credentials: &CredentialsConfig) -> Result<Self> {
        credentials.ensure_complete()?;
        Ok(Self::new(
            credentials.consumer_key.clone(),
            credentials.consumer_secret.clone(),
            credentials.access_token.clone(),
            credentials.access_token_secret.clone(),
        ))
    }

    /// `Authorization` header value with a fresh nonce and the current time.
    pub fn authorization(&self, method: &str, url: &str, form: &[(&str, &str)]) -> Result<String> {
        let nonce: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        let timestamp = chrono::Utc::now().timestamp();
        self.authorization_with(method, url, form, &nonce, timestamp)
    }

    /// Deterministic variant of [`Self::authorization`].
    pub fn authorization_with(
        &self,
        method: &str,
        url: &str,
        form: &[(&str, &str)],
        nonce: &str,
        timestamp: i64,
    ) -> Result<String> {
        let timestamp = timestamp.to_string();
        let mut oauth = vec![
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp.as_str()),
            ("oauth_token", self.token.as_str()),
            ("oauth_version", "1.0"),
        ];

        let base = signature_base_string(method, url, &oauth, form)?;
        let signature = self.sign(&base)?;
        oauth.push(("oauth_signature", signature.as_str()));
        oauth.sort_unstable();

        let fields: Vec<String> = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect();
        Ok(format!("OAuth {}", fields.join(", ")))
    }

    fn signing_key(&self) -> String {
        format!(
            "{}&{}",
            percent_encode(&self.consumer_secret),
            percent_encode(&self.token_secret)
        )
    }

    fn sign(&self, base: &str) -> Result<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(self.signing_key().as_bytes()).map_err(|e| {
            TwsError::Signing {
                details: e.to_string(),
            }
        })?;
        mac.update(base.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// `METHOD&encoded-base-url&encoded-sorted-params`.
fn signature_base_string(
    method: &str,
    url: &str,
    oauth: &[(&str, &str)],
    form: &[(&str, &str)],
) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| TwsError::InvalidEndpoint {
        url: url.to_string(),
        details: e.to_string(),
    })?;
    let host = parsed.host_str().ok_or_else(|| TwsError::InvalidEndpoint {
        url: url.to_string(),
        details: "missing host".to_string(),
    })?;
    let base_url = match parsed.port() {
        Some(port) => format!("{}://{host}:{port}{}", parsed.scheme(), parsed.path()),
        None => format!("{}://{host}{}", parsed.scheme(), parsed.path()),
    };

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (percent_encode(&k), percent_encode(&v)))
        .chain(
            oauth
                .iter()
                .chain(form)
                .map(|(k, v)| (percent_encode(k), percent_encode(v))),
        )
        .collect();
    params.sort_unstable();
    let joined: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();

    Ok(format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(&base_url),
        percent_encode(&joined.join("&"))
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published example from the Twitter "Creating a signature" guide.
    const URL: &str = "https://api.twitter.com/1.1/statuses/update.json?include_entities=true";
    const STATUS: &str = "Hello Ladies + Gentlemen, a signed OAuth request!";
    const NONCE: &str = "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg";
    const TIMESTAMP: i64 = 1_318_622_958;

    fn doc_signer() -> OAuthSigner {
        OAuthSigner::new(
            "xvz1evFS4wEEPTGEFPHBog",
            "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw",
            "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb",
            "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE",
        )
    }

    #[test]
    fn percent_encoding_keeps_unreserved() {
        assert_eq!(percent_encode("Ladies + Gentlemen"), "Ladies%20%2B%20Gentlemen");
        assert_eq!(percent_encode("a-b.c_d~e"), "a-b.c_d~e");
        assert_eq!(percent_encode("#rust"), "%23rust");
        assert_eq!(percent_encode("☃"), "%E2%98%83");
    }

    #[test]
    fn base_string_matches_published_example() {
        let oauth = [
            ("oauth_consumer_key", "xvz1evFS4wEEPTGEFPHBog"),
            ("oauth_nonce", NONCE),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", "1318622958"),
            ("oauth_token", "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb"),
            ("oauth_version", "1.0"),
        ];
        let base = signature_base_string("post", URL, &oauth, &[("status", STATUS)]).unwrap();
        assert!(base.starts_with(
            "POST&https%3A%2F%2Fapi.twitter.com%2F1.1%2Fstatuses%2Fupdate.json&include_entities%3Dtrue%26oauth_consumer_key%3Dxvz1evFS4wEEPTGEFPHBog"
        ));
        assert!(base.ends_with(
            "status%3DHello%2520Ladies%2520%252B%2520Gentlemen%252C%2520a%2520signed%2520OAuth%2520request%2521"
        ));
    }

    #[test]
    fn signature_matches_published_example() {
        let header = doc_signer()
            .authorization_with("POST", URL, &[("status", STATUS)], NONCE, TIMESTAMP)
            .unwrap();
        assert!(
            header.contains("oauth_signature=\"hCtSmYh%2BiHYCEqBWrE7C7hYmtUk%3D\""),
            "{header}"
        );
        assert!(header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\""));
        assert!(header.contains("oauth_version=\"1.0\""));
    }

    #[test]
    fn fresh_nonce_per_request() {
        let signer = doc_signer();
        let a = signer.authorization("POST", URL, &[]).unwrap();
        let b = signer.authorization("POST", URL, &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn explicit_port_is_part_of_base_url() {
        let base = signature_base_string("GET", "http://127.0.0.1:8080/sample.json", &[], &[])
            .unwrap();
        assert!(base.starts_with("GET&http%3A%2F%2F127.0.0.1%3A8080%2Fsample.json&"));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let err = doc_signer()
            .authorization("GET", "not a url", &[])
            .expect_err("should fail");
        assert!(matches!(err, TwsError::InvalidEndpoint { .. }));
    }

    #[test]
    fn incomplete_credentials_rejected() {
        let creds = CredentialsConfig {
            consumer_key: "ck".to_string(),
            ..CredentialsConfig::default()
        };
        assert!(OAuthSigner::from_credentials(&creds).is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", doc_signer());
        assert!(!rendered.contains("kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw"));
    }
}

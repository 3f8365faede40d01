use std::sync::Arc;

use hyper::Uri;

/// Query parameter carrying the attach token.
///
/// Browser WebSocket APIs cannot set an `Authorization` header, so the token
/// travels in the URL.
pub const AUTH_QUERY_PARAM: &str = "auth_token";

/// Minimum accepted token length
pub const MIN_TOKEN_LEN: usize = 40;

/// Checks attach credentials against the configured token
#[derive(Clone)]
pub struct Authenticator {
    token: Arc<str>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Authenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
        }
    }

    /// Compare without short-circuiting on the first differing byte
    pub fn verify(&self, candidate: &str) -> bool {
        let expected = self.token.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Validate the `auth_token` query parameter of an attach request
    pub fn verify_uri(&self, uri: &Uri) -> bool {
        token_from_uri(uri).is_some_and(|token| self.verify(&token))
    }
}

/// Extract the attach token from a request URI
pub fn token_from_uri(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == AUTH_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
}

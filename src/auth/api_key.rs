//! API key authentication.
//!
//! Accepts the key via:
//! - the configured header (default `X-API-Key`)
//! - Bearer token: `Authorization: Bearer <key>`
//! - Basic Auth: any username with the key as password

use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderName};

use super::{AuthError, AuthOutcome};

const DEFAULT_HEADER: &str = "x-api-key";

#[derive(Clone, Debug)]
pub struct ApiKeyAuth {
    keys: Arc<[String]>,
    header: HeaderName,
}

impl ApiKeyAuth {
    /// Create a provider accepting any of `keys` in the `X-API-Key` header.
    pub fn new(keys: Vec<String>) -> Result<Self, AuthError> {
        if keys.is_empty() {
            return Err(AuthError::NoApiKeys);
        }
        Ok(Self {
            keys: Arc::from(keys),
            header: HeaderName::from_static(DEFAULT_HEADER),
        })
    }

    /// Read the key from a custom header. Header names are case-insensitive.
    pub fn with_header(mut self, name: &str) -> Result<Self, AuthError> {
        self.header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AuthError::Provider(format!("invalid header name {name:?}: {e}")))?;
        Ok(self)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn header_name(&self) -> &str {
        self.header.as_str()
    }

    pub(super) fn authenticate(&self, headers: &HeaderMap) -> AuthOutcome {
        let Some(candidate) = self.extract_key(headers) else {
            tracing::debug!(header = %self.header, "API key missing");
            return AuthOutcome::Unauthenticated;
        };

        if self.keys.iter().any(|key| key == &candidate) {
            AuthOutcome::Authenticated { data: None }
        } else {
            tracing::debug!(prefix = %key_prefix(&candidate), "invalid API key");
            AuthOutcome::Unauthenticated
        }
    }

    fn extract_key(&self, headers: &HeaderMap) -> Option<String> {
        for name in [&self.header, &HeaderName::from_static(DEFAULT_HEADER)] {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                return Some(value.to_string());
            }
        }

        let auth_str = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        if let Some(bearer_token) = auth_str.strip_prefix("Bearer ") {
            return Some(bearer_token.to_string());
        }
        if let Some(basic_creds) = auth_str.strip_prefix("Basic ") {
            let decoded = base64_decode(basic_creds).ok()?;
            let (_username, password) = decoded.split_once(':')?;
            return Some(password.to_string());
        }
        None
    }
}

fn key_prefix(key: &str) -> &str {
    key.char_indices().nth(3).map(|(i, _)| &key[..i]).unwrap_or(key)
}

fn base64_decode(input: &str) -> Result<String, ()> {
    use std::io::Read;
    let mut decoder = base64::read::DecoderReader::new(
        input.as_bytes(),
        &base64::engine::general_purpose::STANDARD,
    );
    let mut decoded = String::new();
    decoder.read_to_string(&mut decoded).map_err(|_| ())?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn auth() -> ApiKeyAuth {
        ApiKeyAuth::new(vec!["secret123".to_string(), "other".to_string()]).unwrap()
    }

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn accepted(outcome: AuthOutcome) -> bool {
        matches!(outcome, AuthOutcome::Authenticated { .. })
    }

    #[test]
    fn test_requires_keys() {
        assert!(matches!(ApiKeyAuth::new(vec![]), Err(AuthError::NoApiKeys)));
        assert_eq!(auth().key_count(), 2);
    }

    #[test]
    fn test_valid_header_key() {
        assert!(accepted(auth().authenticate(&headers("x-api-key", "secret123"))));
        assert!(accepted(auth().authenticate(&headers("x-api-key", "other"))));
    }

    #[test]
    fn test_invalid_header_key() {
        assert!(!accepted(auth().authenticate(&headers("x-api-key", "wrong"))));
    }

    #[test]
    fn test_no_auth_header() {
        assert!(!accepted(auth().authenticate(&HeaderMap::new())));
    }

    #[test]
    fn test_custom_header() {
        let auth = auth().with_header("X-Service-Token").unwrap();
        assert_eq!(auth.header_name(), "x-service-token");
        assert!(accepted(auth.authenticate(&headers("x-service-token", "secret123"))));
    }

    #[test]
    fn test_valid_bearer_token() {
        assert!(accepted(auth().authenticate(&headers("authorization", "Bearer secret123"))));
        assert!(!accepted(auth().authenticate(&headers("authorization", "Bearer nope"))));
    }

    #[test]
    fn test_basic_auth_password_is_key() {
        let credentials =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "user:secret123");
        let basic = format!("Basic {credentials}");
        let outcome = auth().authenticate(&headers("authorization", &basic));
        assert!(accepted(outcome));

        let credentials = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            "user:wrongpassword",
        );
        let basic = format!("Basic {credentials}");
        let outcome = auth().authenticate(&headers("authorization", &basic));
        assert!(!accepted(outcome));
    }

    #[test]
    fn test_key_prefix() {
        assert_eq!(key_prefix("abcdef"), "abc");
        assert_eq!(key_prefix("ab"), "ab");
    }
}

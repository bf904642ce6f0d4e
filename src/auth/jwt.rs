//! JWT bearer token authentication.

use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderName};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{json, Value};

use super::{AuthError, AuthOutcome};

#[derive(Clone)]
pub struct JwtAuth {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    header: HeaderName,
    require_bearer: bool,
}

impl JwtAuth {
    /// Verify HS256 tokens from `Authorization: Bearer <token>`.
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::MissingSecret);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present but not required.
        validation.set_required_spec_claims::<&str>(&[]);
        Ok(Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation,
            header: header::AUTHORIZATION,
            require_bearer: true,
        })
    }

    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.validation.algorithms = algorithms;
        self
    }

    pub fn with_header(mut self, name: &str) -> Result<Self, AuthError> {
        self.header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AuthError::Provider(format!("invalid header name {name:?}: {e}")))?;
        Ok(self)
    }

    /// Whether the header value must start with `Bearer `.
    pub fn require_bearer(mut self, require: bool) -> Self {
        self.require_bearer = require;
        self
    }

    pub(super) fn authenticate(&self, headers: &HeaderMap) -> AuthOutcome {
        let Some(value) = headers.get(&self.header).and_then(|v| v.to_str().ok()) else {
            return AuthOutcome::Unauthenticated;
        };

        let token = if self.require_bearer {
            match value.strip_prefix("Bearer ") {
                Some(token) => token,
                None => return AuthOutcome::Unauthenticated,
            }
        } else {
            value.strip_prefix("Bearer ").unwrap_or(value)
        };

        match decode::<Value>(token, &self.decoding_key, &self.validation) {
            Ok(data) => {
                let claims = match data.claims {
                    Value::Object(_) => data.claims,
                    other => json!({ "sub": other }),
                };
                AuthOutcome::Authenticated { data: Some(claims) }
            }
            Err(e) => {
                tracing::debug!(error = %e, "JWT rejected");
                AuthOutcome::Unauthenticated
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret-key-that-is-at-least-32-characters-long";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn token(claims: Value, secret: &str) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_requires_secret() {
        assert!(matches!(JwtAuth::new(""), Err(AuthError::MissingSecret)));
    }

    #[test]
    fn test_valid_token_returns_claims() {
        let auth = JwtAuth::new(SECRET).unwrap();
        let jwt = token(json!({"sub": "alice", "exp": now() + 3600}), SECRET);
        let outcome = auth.authenticate(&bearer(&format!("Bearer {jwt}")));
        match outcome {
            AuthOutcome::Authenticated { data: Some(claims) } => assert_eq!(claims["sub"], "alice"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_token_without_exp_is_accepted() {
        let auth = JwtAuth::new(SECRET).unwrap();
        let jwt = token(json!({"sub": "bob"}), SECRET);
        assert!(matches!(
            auth.authenticate(&bearer(&format!("Bearer {jwt}"))),
            AuthOutcome::Authenticated { .. }
        ));
    }

    #[test]
    fn test_expired_token() {
        let auth = JwtAuth::new(SECRET).unwrap();
        let jwt = token(json!({"sub": "alice", "exp": now() - 3600}), SECRET);
        assert_eq!(
            auth.authenticate(&bearer(&format!("Bearer {jwt}"))),
            AuthOutcome::Unauthenticated
        );
    }

    #[test]
    fn test_wrong_secret() {
        let auth = JwtAuth::new(SECRET).unwrap();
        let jwt = token(json!({"sub": "alice"}), "another-secret-entirely-different-value");
        assert_eq!(
            auth.authenticate(&bearer(&format!("Bearer {jwt}"))),
            AuthOutcome::Unauthenticated
        );
    }

    #[test]
    fn test_bearer_prefix() {
        let jwt = token(json!({"sub": "alice"}), SECRET);
        let strict = JwtAuth::new(SECRET).unwrap();
        assert_eq!(strict.authenticate(&bearer(&jwt)), AuthOutcome::Unauthenticated);

        let lenient = JwtAuth::new(SECRET).unwrap().require_bearer(false);
        assert!(matches!(
            lenient.authenticate(&bearer(&jwt)),
            AuthOutcome::Authenticated { .. }
        ));
    }

    #[test]
    fn test_custom_header() {
        let auth = JwtAuth::new(SECRET)
            .unwrap()
            .with_header("X-Access-Token")
            .unwrap()
            .require_bearer(false);
        let jwt = token(json!({"sub": "carol"}), SECRET);
        let mut headers = HeaderMap::new();
        headers.insert("x-access-token", HeaderValue::from_str(&jwt).unwrap());
        assert!(matches!(
            auth.authenticate(&headers),
            AuthOutcome::Authenticated { .. }
        ));
    }
}

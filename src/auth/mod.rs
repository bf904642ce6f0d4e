//! Pluggable request authentication.
//!
//! An [`AuthProvider`] is one of a fixed set of variants, dispatched on the
//! enum tag: API keys, JWT bearer tokens, or a [`Custom`](AuthProvider::Custom)
//! implementation of [`Authenticator`]. The transport consults the provider
//! before any message in a request is dispatched; without a provider,
//! authentication is skipped.

mod api_key;
#[cfg(feature = "jwt")]
mod jwt;

pub use api_key::ApiKeyAuth;
#[cfg(feature = "jwt")]
pub use jwt::JwtAuth;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use futures::future::BoxFuture;
use serde_json::Value;

/// Result of a completed authentication attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// Credentials accepted. `data` carries provider specific identity data,
    /// e.g. decoded JWT claims.
    Authenticated { data: Option<Value> },
    Unauthenticated,
}

/// HTTP status and message sent when authentication fails.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthErrorDetails {
    pub status: StatusCode,
    pub message: String,
}

impl Default for AuthErrorDetails {
    fn default() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Unauthorized".to_string(),
        }
    }
}

impl AuthErrorDetails {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("at least one API key is required")]
    NoApiKeys,
    #[error("JWT secret is required")]
    MissingSecret,
    /// The provider itself failed, as opposed to rejecting the credentials.
    #[error("{0}")]
    Provider(String),
}

/// Custom authentication logic.
///
/// # Example
///
/// ```rust
/// use axum::http::HeaderMap;
/// use futures::future::BoxFuture;
/// use mcp_http_stream::auth::{AuthError, AuthOutcome, Authenticator};
///
/// struct HostAllowList;
///
/// impl Authenticator for HostAllowList {
///     fn authenticate<'a>(
///         &'a self,
///         headers: &'a HeaderMap,
///     ) -> BoxFuture<'a, Result<AuthOutcome, AuthError>> {
///         Box::pin(async move {
///             match headers.get("host").and_then(|h| h.to_str().ok()) {
///                 Some("localhost") => Ok(AuthOutcome::Authenticated { data: None }),
///                 _ => Ok(AuthOutcome::Unauthenticated),
///             }
///         })
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate<'a>(
        &'a self,
        headers: &'a HeaderMap,
    ) -> BoxFuture<'a, Result<AuthOutcome, AuthError>>;

    fn auth_error(&self) -> AuthErrorDetails {
        AuthErrorDetails::default()
    }
}

#[derive(Clone)]
pub enum AuthProvider {
    ApiKey(ApiKeyAuth),
    #[cfg(feature = "jwt")]
    Jwt(JwtAuth),
    Custom(Arc<dyn Authenticator>),
}

impl AuthProvider {
    pub fn custom(authenticator: impl Authenticator) -> Self {
        AuthProvider::Custom(Arc::new(authenticator))
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthProvider::ApiKey(_) => "api-key",
            #[cfg(feature = "jwt")]
            AuthProvider::Jwt(_) => "jwt",
            AuthProvider::Custom(_) => "custom",
        }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthOutcome, AuthError> {
        match self {
            AuthProvider::ApiKey(auth) => Ok(auth.authenticate(headers)),
            #[cfg(feature = "jwt")]
            AuthProvider::Jwt(auth) => Ok(auth.authenticate(headers)),
            AuthProvider::Custom(auth) => auth.authenticate(headers).await,
        }
    }

    pub fn auth_error(&self) -> AuthErrorDetails {
        match self {
            AuthProvider::ApiKey(_) => AuthErrorDetails::unauthorized("Invalid API key"),
            #[cfg(feature = "jwt")]
            AuthProvider::Jwt(_) => AuthErrorDetails::unauthorized("Invalid or expired JWT token"),
            AuthProvider::Custom(auth) => auth.auth_error(),
        }
    }
}

impl std::fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AuthProvider").field(&self.kind()).finish()
    }
}

impl From<ApiKeyAuth> for AuthProvider {
    fn from(auth: ApiKeyAuth) -> Self {
        AuthProvider::ApiKey(auth)
    }
}

#[cfg(feature = "jwt")]
impl From<JwtAuth> for AuthProvider {
    fn from(auth: JwtAuth) -> Self {
        AuthProvider::Jwt(auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Authenticator for Failing {
        fn authenticate<'a>(
            &'a self,
            _headers: &'a HeaderMap,
        ) -> BoxFuture<'a, Result<AuthOutcome, AuthError>> {
            Box::pin(async { Err(AuthError::Provider("directory offline".into())) })
        }

        fn auth_error(&self) -> AuthErrorDetails {
            AuthErrorDetails {
                status: StatusCode::FORBIDDEN,
                message: "go away".into(),
            }
        }
    }

    #[tokio::test]
    async fn test_custom_provider_dispatch() {
        let provider = AuthProvider::custom(Failing);
        assert_eq!(provider.kind(), "custom");
        let result = provider.authenticate(&HeaderMap::new()).await;
        assert_eq!(result, Err(AuthError::Provider("directory offline".into())));
        assert_eq!(provider.auth_error().status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_api_key_error_details() {
        let provider = AuthProvider::from(ApiKeyAuth::new(vec!["k".into()]).unwrap());
        let details = provider.auth_error();
        assert_eq!(details.status, StatusCode::UNAUTHORIZED);
        assert_eq!(details.message, "Invalid API key");
    }
}

//! CORS and configured extra headers for every response.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    http::{HeaderName, HeaderValue, Method},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::CorsConfig;

fn entries(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn is_wildcard(value: &str) -> bool {
    entries(value).any(|v| v == "*")
}

fn header_names(field: &str, value: &str) -> Vec<HeaderName> {
    entries(value)
        .filter_map(|name| match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => Some(name),
            Err(_) => {
                tracing::warn!(field, header = name, "ignoring invalid CORS header name");
                None
            }
        })
        .collect()
}

/// Build the CORS layer from configuration.
///
/// An empty `allow_origin` echoes the request's `Origin`. The session header,
/// when sessions are on, is always exposed so browsers can read it.
fn cors_layer(cors: &CorsConfig, session_header: Option<&str>) -> CorsLayer {
    let origin = if cors.allow_origin.trim().is_empty() {
        AllowOrigin::mirror_request()
    } else if is_wildcard(&cors.allow_origin) {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(entries(&cors.allow_origin).filter_map(|origin| {
            match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin, "ignoring invalid CORS origin");
                    None
                }
            }
        }))
    };

    let methods = if is_wildcard(&cors.allow_methods) {
        AllowMethods::any()
    } else {
        AllowMethods::list(
            entries(&cors.allow_methods).filter_map(|m| Method::from_bytes(m.as_bytes()).ok()),
        )
    };

    let headers = if is_wildcard(&cors.allow_headers) {
        AllowHeaders::any()
    } else {
        AllowHeaders::list(header_names("allow_headers", &cors.allow_headers))
    };

    let expose = if is_wildcard(&cors.expose_headers) {
        ExposeHeaders::any()
    } else {
        let mut names = header_names("expose_headers", &cors.expose_headers);
        let session = session_header.and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok());
        if let Some(session) = session {
            if !names.contains(&session) {
                names.push(session);
            }
        }
        ExposeHeaders::list(names)
    };

    let mut layer = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(expose);
    match cors.max_age.trim().parse::<u64>() {
        Ok(secs) => layer = layer.max_age(Duration::from_secs(secs)),
        Err(_) if cors.max_age.trim().is_empty() => {}
        Err(_) => tracing::warn!(max_age = %cors.max_age, "ignoring invalid CORS max age"),
    }
    layer
}

/// Wrap `router` with the CORS layer and one header layer per configured
/// extra header. Headers set by a handler are left alone.
pub(crate) fn with_response_headers(
    router: Router,
    cors: &CorsConfig,
    extra: &HashMap<String, String>,
    session_header: Option<&str>,
) -> Router {
    let mut router = router.layer(cors_layer(cors, session_header));
    for (name, value) in extra {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::warn!(header = %name, "ignoring invalid extra response header");
            continue;
        };
        router = router.layer(SetResponseHeaderLayer::if_not_present(name, value));
    }
    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request},
        routing::get,
    };
    use tower::ServiceExt;

    fn app(cors: CorsConfig, extra: &[(&str, &str)]) -> Router {
        let extra = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let router =
            Router::new().route("/mcp", get(|| async { ([("x-served-by", "handler")], "ok") }));
        with_response_headers(router, &cors, &extra, Some("Mcp-Session-Id"))
    }

    fn request(method: Method, origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("/mcp");
        if let Some(origin) = origin {
            builder = builder
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST");
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let response = app(CorsConfig::default(), &[("X-Powered-By", "mcp")])
            .oneshot(request(Method::OPTIONS, Some("https://app.example")))
            .await
            .unwrap();

        assert!(response.status().is_success());
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
        assert!(headers[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("DELETE"));
        assert!(headers.get("x-served-by").is_none());
        assert_eq!(headers["x-powered-by"], "mcp");
    }

    #[tokio::test]
    async fn test_regular_response_is_decorated() {
        let response = app(CorsConfig::default(), &[("X-Powered-By", "mcp")])
            .oneshot(request(Method::GET, Some("https://app.example")))
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-powered-by"], "mcp");
        assert_eq!(headers["x-served-by"], "handler");
        assert!(headers.get(header::ACCESS_CONTROL_MAX_AGE).is_none());
        let expose = headers[header::ACCESS_CONTROL_EXPOSE_HEADERS]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(expose.contains("x-api-key"));
        assert!(expose.contains("mcp-session-id"));
    }

    #[tokio::test]
    async fn test_handler_headers_win() {
        let response = app(CorsConfig::default(), &[("x-served-by", "config")])
            .oneshot(request(Method::GET, None))
            .await
            .unwrap();
        assert_eq!(response.headers()["x-served-by"], "handler");
    }

    #[tokio::test]
    async fn test_empty_origin_is_echoed() {
        let cors = CorsConfig {
            allow_origin: String::new(),
            ..CorsConfig::default()
        };
        let response = app(cors, &[])
            .oneshot(request(Method::GET, Some("https://app.example")))
            .await
            .unwrap();
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example"
        );
        assert!(headers
            .get_all(header::VARY)
            .iter()
            .any(|v| v.to_str().unwrap().to_ascii_lowercase().contains("origin")));
    }

    #[tokio::test]
    async fn test_origin_list_rejects_others() {
        let cors = CorsConfig {
            allow_origin: "https://a.example, https://b.example".to_string(),
            ..CorsConfig::default()
        };
        let allowed = app(cors.clone(), &[])
            .oneshot(request(Method::GET, Some("https://b.example")))
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://b.example"
        );

        let other = app(cors, &[])
            .oneshot(request(Method::GET, Some("https://evil.example")))
            .await
            .unwrap();
        assert!(other
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }
}

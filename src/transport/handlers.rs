//! HTTP surface: the axum router and the GET/POST/DELETE handlers.

use std::collections::HashSet;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{sse::Sse, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::Value;

use super::batch::BatchOutcome;
use super::connection::{OpenStream, SseStream};
use super::cors::with_response_headers;
use super::session::SessionId;
use super::HttpStreamTransport;
use crate::auth::AuthOutcome;
use crate::config::ResponseMode;
use crate::error::{RejectedRequest, TransportError};
use crate::jsonrpc::{parse_body, Envelope, RequestId};

const JSON_CONTENT_TYPE: &str = "application/json";
const SSE_CONTENT_TYPE: &str = "text/event-stream";
const LAST_EVENT_ID: &str = "last-event-id";

fn media_type(value: &str) -> &str {
    value.split(';').next().unwrap_or_default().trim()
}

fn accepts(headers: &HeaderMap, wanted: &str) -> bool {
    let wanted_type = wanted.split('/').next().unwrap_or_default();
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(media_type)
        .any(|range| {
            range == "*/*"
                || range.eq_ignore_ascii_case(wanted)
                || range
                    .strip_suffix("/*")
                    .is_some_and(|t| t.eq_ignore_ascii_case(wanted_type))
        })
}

fn require_json(headers: &HeaderMap) -> Result<(), TransportError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or(TransportError::UnsupportedMediaType)?;
    if media_type(content_type).eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
        Ok(())
    } else {
        Err(TransportError::UnsupportedMediaType)
    }
}

fn sse_response(stream: SseStream) -> Response {
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

impl HttpStreamTransport {
    /// Build the axum router serving the configured endpoint.
    pub fn router(&self) -> Router {
        self.start_maintenance();
        let config = &self.inner.config;
        let session_header = config
            .session
            .enabled
            .then_some(config.session.header_name.as_str());

        let router = Router::new()
            .route(
                &config.endpoint,
                get(handle_get)
                    .post(handle_post)
                    .delete(handle_delete)
                    .fallback(method_not_allowed),
            )
            .fallback(not_found)
            .with_state(self.clone());
        with_response_headers(router, &config.cors, &config.headers, session_header)
    }

    fn session_token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(&self.inner.session_header)
            .and_then(|v| v.to_str().ok())
    }

    fn attach_session(&self, response: &mut Response, session_id: Option<&SessionId>) {
        let Some(session_id) = session_id else {
            return;
        };
        match HeaderValue::from_str(session_id) {
            Ok(value) => {
                response
                    .headers_mut()
                    .insert(self.inner.session_header.clone(), value);
            }
            Err(e) => tracing::error!(
                session_id = %session_id,
                error = %e,
                "session id is not a valid header value"
            ),
        }
    }

    /// Run the auth provider, if any. Returns the provider's identity data.
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        context: &str,
    ) -> Result<Option<Value>, TransportError> {
        let provider = self.inner.auth.read().clone();
        let Some(provider) = provider else {
            return Ok(None);
        };

        match provider.authenticate(headers).await {
            Ok(AuthOutcome::Authenticated { data }) => {
                tracing::debug!(provider = provider.kind(), context, "authenticated");
                Ok(data)
            }
            Ok(AuthOutcome::Unauthenticated) => {
                let details = provider.auth_error();
                tracing::warn!(
                    provider = provider.kind(),
                    context,
                    status = %details.status,
                    "authentication failed"
                );
                Err(TransportError::AuthenticationFailed {
                    status: details.status,
                    message: details.message,
                })
            }
            Err(e) => {
                tracing::error!(
                    provider = provider.kind(),
                    context,
                    error = %e,
                    "authentication provider error"
                );
                Err(TransportError::AuthProvider(e.to_string()))
            }
        }
    }

    /// Reject ids repeated within one POST or still awaiting a response.
    fn check_request_ids(&self, ids: &[RequestId]) -> Result<(), TransportError> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id) {
                return Err(TransportError::DuplicateRequestId(id.clone()));
            }
            if self.inner.batches.is_tracking(id) || self.inner.connections.is_routed(id) {
                return Err(TransportError::RequestIdInFlight(id.clone()));
            }
        }
        Ok(())
    }

    async fn post(&self, headers: HeaderMap, body: Body) -> Result<Response, RejectedRequest> {
        require_json(&headers)?;
        if !(accepts(&headers, JSON_CONTENT_TYPE) && accepts(&headers, SSE_CONTENT_TYPE)) {
            tracing::warn!(
                accept = ?headers.get(header::ACCEPT),
                "POST rejected: Accept header missing required types"
            );
            return Err(TransportError::NotAcceptable(
                "Accept header must include application/json and text/event-stream",
            )
            .into());
        }
        let auth = self.authenticate(&headers, "POST").await?;

        let limit = self.inner.config.max_message_size;
        let bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
            tracing::warn!(limit, error = %e, "failed to read POST body");
            TransportError::PayloadTooLarge { limit }
        })?;
        let messages = parse_body(&bytes).map_err(|e| {
            tracing::warn!(error = %e, "malformed POST body");
            TransportError::from(e)
        })?;
        let first_id = messages.iter().find_map(|m| m.id().cloned());
        let reject = |e: TransportError| e.with_request_id(first_id.clone());

        let sessions_enabled = self.inner.config.session.enabled;
        let is_initialize = messages.iter().any(Envelope::is_initialize);
        let token = self.session_token(&headers);
        let mut session_id = None;
        if sessions_enabled {
            if is_initialize {
                if token.is_some() {
                    tracing::warn!("initialize request carried a session id");
                    return Err(reject(TransportError::DuplicateSessionOnInit));
                }
            } else {
                session_id = self
                    .inner
                    .sessions
                    .validate(token, true)
                    .map_err(reject)?
                    .map(|s| s.id);
            }
        }

        let (requests, others): (Vec<Envelope>, Vec<Envelope>) = messages
            .into_iter()
            .partition(|m| matches!(m, Envelope::Request(_)));
        let request_ids: Vec<RequestId> = requests.iter().filter_map(|m| m.id().cloned()).collect();
        self.check_request_ids(&request_ids).map_err(reject)?;

        let created = (sessions_enabled && is_initialize).then(|| self.inner.sessions.create().id);
        if created.is_some() {
            session_id = created.clone();
        }

        for message in others {
            self.dispatch(message, session_id.as_ref(), auth.as_ref());
        }
        if requests.is_empty() {
            tracing::debug!("POST carried only notifications and responses");
            return Ok(StatusCode::ACCEPTED.into_response());
        }

        tracing::debug!(
            requests = requests.len(),
            mode = ?self.inner.config.response_mode,
            session_id = ?session_id,
            "dispatching requests"
        );
        let mut response = match self.inner.config.response_mode {
            ResponseMode::Batch => {
                let mut batch = self.inner.batches.open(request_ids);
                for request in requests {
                    self.dispatch(request, session_id.as_ref(), auth.as_ref());
                }
                match batch.wait().await {
                    BatchOutcome::Complete(responses) => {
                        (StatusCode::OK, Json(responses)).into_response()
                    }
                    BatchOutcome::TimedOut { missing } => {
                        TransportError::BatchTimeout { missing }.into_response()
                    }
                    BatchOutcome::Closed => {
                        TransportError::Internal("transport closed".to_string()).into_response()
                    }
                }
            }
            ResponseMode::Stream => {
                let (connection, stream) = self.inner.connections.open(OpenStream {
                    session_id: session_id.clone(),
                    last_event_id: None,
                    pending: Some(request_ids),
                });
                tracing::debug!(stream_id = %connection.stream_id, "answering POST over SSE");
                for request in requests {
                    self.dispatch(request, session_id.as_ref(), auth.as_ref());
                }
                sse_response(stream)
            }
        };
        self.attach_session(&mut response, created.as_ref());
        Ok(response)
    }

    async fn get(&self, headers: HeaderMap) -> Result<Response, RejectedRequest> {
        if !accepts(&headers, SSE_CONTENT_TYPE) {
            return Err(TransportError::NotAcceptable(
                "GET requires Accept header including text/event-stream",
            )
            .into());
        }
        self.authenticate(&headers, "GET").await?;

        let session_id = if self.inner.config.session.enabled {
            self.inner
                .sessions
                .validate(self.session_token(&headers), true)?
                .map(|s| s.id)
        } else {
            None
        };

        let last_event_id = headers
            .get(LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(last_event_id) = &last_event_id {
            if !self.inner.connections.store().is_enabled() {
                tracing::warn!(
                    last_event_id = %last_event_id,
                    "Last-Event-ID sent but resumability is disabled"
                );
            }
        }

        let (connection, stream) = self.inner.connections.open(OpenStream {
            session_id,
            last_event_id,
            pending: None,
        });
        tracing::debug!(stream_id = %connection.stream_id, "GET stream established");
        Ok(sse_response(stream))
    }

    async fn delete(&self, headers: HeaderMap) -> Result<Response, RejectedRequest> {
        let session_config = &self.inner.config.session;
        if !session_config.enabled {
            return Err(TransportError::MethodNotAllowed("sessions are disabled").into());
        }
        if !session_config.allow_client_termination {
            return Err(TransportError::MethodNotAllowed(
                "client session termination is disabled",
            )
            .into());
        }
        self.authenticate(&headers, "DELETE").await?;

        let session = self
            .inner
            .sessions
            .validate(self.session_token(&headers), true)?
            .ok_or_else(|| TransportError::MissingSession {
                header: session_config.header_name.clone(),
            })?;
        self.terminate_session(&session.id, "Session terminated via DELETE");
        Ok((StatusCode::OK, "Session terminated").into_response())
    }
}

async fn handle_post(
    State(transport): State<HttpStreamTransport>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, RejectedRequest> {
    transport.post(headers, body).await
}

async fn handle_get(
    State(transport): State<HttpStreamTransport>,
    headers: HeaderMap,
) -> Result<Response, RejectedRequest> {
    transport.get(headers).await
}

async fn handle_delete(
    State(transport): State<HttpStreamTransport>,
    headers: HeaderMap,
) -> Result<Response, RejectedRequest> {
    transport.delete(headers).await
}

async fn method_not_allowed(method: Method) -> TransportError {
    tracing::warn!(%method, "unsupported method");
    TransportError::MethodNotAllowed("use GET, POST or DELETE")
}

async fn not_found(uri: Uri) -> TransportError {
    tracing::warn!(path = uri.path(), "request to unknown path");
    TransportError::UnknownEndpoint
}

//! Streamable HTTP transport.
//!
//! One endpoint accepts JSON-RPC over `POST`, opens server-to-client event
//! streams on `GET` and ends sessions on `DELETE`. Requests in a POST are
//! answered either as one aggregated JSON array or over an SSE stream scoped
//! to that POST, depending on [`ResponseMode`](crate::config::ResponseMode).
//!
//! Inbound messages are handed to a [`MessageHandler`]; replies and
//! server-initiated messages come back through [`HttpStreamTransport::send`].
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_http_stream::config::TransportConfig;
//! use mcp_http_stream::jsonrpc::Envelope;
//! use mcp_http_stream::transport::{HttpStreamTransport, IncomingMessage};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpStreamTransport::new(TransportConfig::from_env())?;
//! let replies = transport.clone();
//! transport.set_handler(move |incoming: IncomingMessage| {
//!     if let Envelope::Request(request) = incoming.message {
//!         replies.send(Envelope::success(request.id, json!({})));
//!     }
//! });
//!
//! let listener = transport.bind().await?;
//! transport.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod connection;
mod cors;
mod grace;
mod handlers;
mod resumability;
mod router;
mod session;

pub use session::SessionId;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::HeaderName;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthProvider;
use crate::config::{ConfigError, ResumabilityMode, TransportConfig};
use crate::jsonrpc::Envelope;
use batch::BatchAggregator;
use connection::ConnectionManager;
use resumability::ResumabilityStore;
use session::SessionRegistry;

/// A classified inbound message with the context it arrived in.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: Envelope,
    pub session_id: Option<SessionId>,
    /// Identity data returned by the auth provider, e.g. JWT claims.
    pub auth: Option<Value>,
}

/// Receives every accepted inbound message.
///
/// Called synchronously from the HTTP handler; long running work should be
/// spawned. Replies go through [`HttpStreamTransport::send`]. A panic is
/// caught and logged, and the remaining messages of the request are still
/// delivered.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, incoming: IncomingMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(IncomingMessage) + Send + Sync + 'static,
{
    fn on_message(&self, incoming: IncomingMessage) {
        self(incoming)
    }
}

#[derive(Clone)]
pub struct HttpStreamTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    session_header: HeaderName,
    sessions: SessionRegistry,
    connections: ConnectionManager,
    batches: BatchAggregator,
    auth: RwLock<Option<AuthProvider>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    shutdown: CancellationToken,
    running: AtomicBool,
    maintenance: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl HttpStreamTransport {
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let session_header = HeaderName::from_bytes(config.session.header_name.as_bytes())
            .map_err(|_| ConfigError::InvalidSessionHeader(config.session.header_name.clone()))?;

        let shutdown = CancellationToken::new();
        let store = ResumabilityStore::new(
            config.resumability.mode,
            config.resumability.history_duration,
        );
        let connections = ConnectionManager::new(
            store,
            config.dropped_response_grace,
            config.ping_interval,
            shutdown.clone(),
        );

        let transport = Self {
            inner: Arc::new(Inner {
                sessions: SessionRegistry::new(config.session.header_name.clone()),
                batches: BatchAggregator::new(config.batch_timeout),
                connections,
                session_header,
                auth: RwLock::new(None),
                handler: RwLock::new(None),
                shutdown,
                running: AtomicBool::new(false),
                maintenance: AtomicBool::new(false),
                config,
            }),
        };
        transport.start_maintenance();
        Ok(transport)
    }

    pub fn with_auth(self, provider: impl Into<AuthProvider>) -> Self {
        self.set_auth(provider);
        self
    }

    pub fn set_auth(&self, provider: impl Into<AuthProvider>) {
        let provider = provider.into();
        tracing::info!(provider = provider.kind(), "authentication enabled");
        *self.inner.auth.write() = Some(provider);
    }

    pub fn with_handler(self, handler: impl MessageHandler) -> Self {
        self.set_handler(handler);
        self
    }

    pub fn set_handler(&self, handler: impl MessageHandler) {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.count()
    }

    pub fn pending_batches(&self) -> usize {
        self.inner.batches.pending_count()
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.inner.config.socket_addr()).await
    }

    /// Serve the transport until [`close`](Self::close) is called.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        self.start_maintenance();
        let shutdown = self.inner.shutdown.clone();
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            endpoint = %self.inner.config.endpoint,
            mode = ?self.inner.config.response_mode,
            resumability = ?self.inner.config.resumability.mode,
            "streamable HTTP transport listening"
        );

        self.inner.running.store(true, Ordering::SeqCst);
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        self.inner.running.store(false, Ordering::SeqCst);
        self.cleanup_all("Server shutting down");
        result
    }

    /// Close every stream, abort pending batches, drop all sessions and stop
    /// the server.
    pub fn close(&self) {
        self.cleanup_all("Transport closed");
        self.inner.shutdown.cancel();
    }

    fn cleanup_all(&self, reason: &str) {
        self.inner.connections.cleanup_all(reason);
        self.inner.batches.close_all();
        self.inner.sessions.clear();
        self.inner.connections.store().clear();
        tracing::info!(reason, "transport state cleared");
    }

    /// End a session and everything bound to it.
    pub fn terminate_session(&self, session_id: &SessionId, reason: &str) -> bool {
        let removed = self.inner.sessions.remove(session_id).is_some();
        let closed = self.inner.connections.close_session(session_id, reason);
        self.inner.connections.store().forget_session(session_id);
        if let Some(grace) = self.inner.connections.grace() {
            grace.forget_session(session_id);
        }
        if removed {
            tracing::info!(
                session_id = %session_id,
                reason,
                closed_streams = closed,
                "session terminated"
            );
        }
        removed
    }

    fn dispatch(&self, message: Envelope, session_id: Option<&SessionId>, auth: Option<&Value>) {
        let handler = self.inner.handler.read().clone();
        let Some(handler) = handler else {
            tracing::error!(
                method = ?message.method(),
                "no message handler installed, message dropped"
            );
            return;
        };
        let method = message.method().map(str::to_string);
        let incoming = IncomingMessage {
            message,
            session_id: session_id.cloned(),
            auth: auth.cloned(),
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_message(incoming))) {
            let reason = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            tracing::error!(?method, reason, "message handler panicked");
        }
    }

    fn needs_maintenance(&self) -> bool {
        let config = &self.inner.config;
        config.resumability.mode != ResumabilityMode::Off
            || config.session.idle_timeout.is_some()
            || config.dropped_response_grace.is_some()
    }

    /// Start the periodic sweep once a runtime is available.
    fn start_maintenance(&self) {
        if !self.needs_maintenance() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.inner.maintenance.swap(true, Ordering::SeqCst) {
            return;
        }

        let period = self.inner.config.sweep_interval();
        let shutdown = self.inner.shutdown.clone();
        let inner = Arc::downgrade(&self.inner);
        tracing::debug!(?period, "maintenance sweep started");
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        HttpStreamTransport { inner }.sweep(Instant::now());
                    }
                }
            }
        });
    }

    fn sweep(&self, now: Instant) {
        self.inner.connections.store().prune(now);
        if let Some(grace) = self.inner.connections.grace() {
            grace.prune(now);
        }
        if let Some(idle) = self.inner.config.session.idle_timeout {
            for session_id in self.inner.sessions.idle_since(now, idle) {
                if self.inner.connections.has_streams(&session_id) {
                    continue;
                }
                self.terminate_session(&session_id, "Session idle timeout");
            }
        }
    }
}

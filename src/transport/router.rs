//! Outbound routing: where does a message handed to `send` go.

use super::connection::SseConnection;
use super::HttpStreamTransport;
use crate::jsonrpc::{Envelope, EnvelopeKind};

impl HttpStreamTransport {
    /// Deliver a message to the client.
    ///
    /// A response with an id goes to the batch waiting for it, else to the
    /// stream its request arrived on. If that stream is gone the response is
    /// parked for its session when a grace period is configured and dropped
    /// otherwise. Requests, notifications and responses without an id are
    /// pushed to any open stream, see `fallback_target`.
    pub fn send(&self, message: Envelope) {
        let inner = &self.inner;

        if let Some(id) = message.id().filter(|_| message.is_response()) {
            if inner.batches.collect(&message) {
                return;
            }

            if let Some(connection) = inner.connections.take_route(id) {
                self.deliver(&connection, &message);
                return;
            }

            let orphan_session = inner.connections.grace().and_then(|g| g.claim(id));
            if let Some(session_id) = orphan_session {
                match inner.connections.fallback_for_session(&session_id) {
                    Some(connection) => self.deliver(&connection, &message),
                    None => {
                        tracing::info!(
                            request_id = %id,
                            session_id = %session_id,
                            "stream gone, parking response"
                        );
                        if let Some(grace) = inner.connections.grace() {
                            grace.park(&session_id, message);
                        }
                    }
                }
                return;
            }

            tracing::warn!(request_id = %id, "no open stream or batch for response, dropping it");
            return;
        }

        match self.fallback_target(&message) {
            Some(connection) => self.deliver(&connection, &message),
            None => tracing::error!(
                kind = ?message.kind(),
                method = ?message.method(),
                "no open stream for outbound message, dropping it"
            ),
        }
    }

    /// Last-resort stream choice for messages without a routed id.
    ///
    /// Responses without an id prefer a POST stream, which is where the
    /// failing request came from. Server-initiated requests and notifications
    /// prefer a GET stream, which exists for exactly that purpose. Either
    /// falls back to any open stream, oldest first.
    fn fallback_target(&self, message: &Envelope) -> Option<std::sync::Arc<SseConnection>> {
        let prefer_post = matches!(
            message.kind(),
            EnvelopeKind::SuccessResponse | EnvelopeKind::ErrorResponse
        );
        self.inner.connections.fallback(prefer_post)
    }

    fn deliver(&self, connection: &SseConnection, message: &Envelope) {
        let connections = &self.inner.connections;
        match connection.write_message(message, connections.store()) {
            Ok(event_id) => {
                tracing::debug!(
                    stream_id = %connection.stream_id,
                    request_id = ?message.id(),
                    event_id = ?event_id.map(|id| id.to_string()),
                    "message delivered"
                );
                if message.is_response() {
                    connections.close_if_drained(connection);
                }
            }
            Err(e) => {
                tracing::error!(stream_id = %connection.stream_id, error = %e, "write failed");
                connections.cleanup(&connection.stream_id, "Write error");
            }
        }
    }
}

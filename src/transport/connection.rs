//! Open SSE streams and the request-id routing table.
//!
//! Each stream is backed by an unbounded channel; every write pushes one
//! complete event onto it while holding the connection state lock, so event
//! ids go out in the order they were minted. Dropping the sender ends the HTTP
//! response after the buffered events have been flushed.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::response::sse::Event;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::grace::GraceQueue;
use super::resumability::{EventId, HistoryEntry, ResumabilityStore};
use super::session::SessionId;
use crate::jsonrpc::{Envelope, RequestId};

pub(crate) type StreamId = Arc<str>;

pub(crate) type SseStream = BoxStream<'static, Result<Event, Infallible>>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum WriteError {
    #[error("stream is closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

fn generate_stream_id() -> StreamId {
    let random: u64 = rand::random();
    Arc::from(format!("{:016x}", random))
}

struct ConnectionState {
    tx: Option<mpsc::UnboundedSender<Event>>,
    /// Request ids still owed a response. `None` for GET streams.
    pending: Option<HashSet<RequestId>>,
    last_event_id_sent: Option<EventId>,
    history: Vec<HistoryEntry>,
}

pub(crate) struct SseConnection {
    pub stream_id: StreamId,
    pub session_id: Option<SessionId>,
    pub post_originated: bool,
    opened_seq: u64,
    cancel: CancellationToken,
    state: Mutex<ConnectionState>,
}

impl SseConnection {
    fn push(state: &ConnectionState, event: Event) -> Result<(), WriteError> {
        match &state.tx {
            Some(tx) => tx.send(event).map_err(|_| WriteError::Closed),
            None => Err(WriteError::Closed),
        }
    }

    pub fn write_comment(&self, text: &str) -> Result<(), WriteError> {
        let state = self.state.lock();
        Self::push(&state, Event::default().comment(text))
    }

    /// Write one message as an SSE event, stamping and recording it when
    /// resumability is on.
    pub fn write_message(
        &self,
        message: &Envelope,
        store: &ResumabilityStore,
    ) -> Result<Option<EventId>, WriteError> {
        let data = serde_json::to_string(message)?;
        let mut state = self.state.lock();
        if state.tx.is_none() {
            return Err(WriteError::Closed);
        }

        let mut event = Event::default();
        let mut event_id = None;
        if store.is_enabled() {
            let id = store.next_event_id();
            let entry = HistoryEntry {
                event_id: id,
                data: Arc::from(data.as_str()),
                recorded_at: Instant::now(),
            };
            store.record(&mut state.history, self.session_id.as_ref(), entry);
            state.last_event_id_sent = Some(id);
            event = event.id(id.to_string());
            event_id = Some(id);
        }
        Self::push(&state, event.data(data))?;
        Ok(event_id)
    }

    fn replay(&self, entries: &[HistoryEntry]) -> Result<(), WriteError> {
        let mut state = self.state.lock();
        for entry in entries {
            let event = Event::default()
                .id(entry.event_id.to_string())
                .data(&*entry.data);
            Self::push(&state, event)?;
            state.last_event_id_sent = Some(entry.event_id);
        }
        Ok(())
    }

    pub fn last_event_id_sent(&self) -> Option<EventId> {
        self.state.lock().last_event_id_sent
    }

    fn remove_pending(&self, id: &RequestId) {
        if let Some(pending) = self.state.lock().pending.as_mut() {
            pending.remove(id);
        }
    }

    /// A POST stream with every response delivered.
    pub fn is_drained(&self) -> bool {
        self.post_originated
            && self
                .state
                .lock()
                .pending
                .as_ref()
                .is_some_and(HashSet::is_empty)
    }

    /// Stop accepting writes and hand back the history.
    fn close(&self) -> Vec<HistoryEntry> {
        let mut state = self.state.lock();
        state.tx = None;
        std::mem::take(&mut state.history)
    }
}

/// What a new stream is opened for.
pub(crate) struct OpenStream {
    pub session_id: Option<SessionId>,
    pub last_event_id: Option<String>,
    /// Request ids the stream answers. `Some` marks a POST stream.
    pub pending: Option<Vec<RequestId>>,
}

#[derive(Clone)]
pub(crate) struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    active: Mutex<HashMap<StreamId, Arc<SseConnection>>>,
    request_streams: Mutex<HashMap<RequestId, StreamId>>,
    store: ResumabilityStore,
    grace: Option<GraceQueue>,
    ping_interval: Duration,
    shutdown: CancellationToken,
    next_seq: AtomicU64,
}

/// Ends the stream's bookkeeping when the response body is dropped.
struct StreamGuard {
    shared: Weak<Shared>,
    stream_id: StreamId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            ConnectionManager { shared }.cleanup(&self.stream_id, "Client closed connection");
        }
    }
}

impl ConnectionManager {
    pub fn new(
        store: ResumabilityStore,
        grace: Option<Duration>,
        ping_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                active: Mutex::new(HashMap::new()),
                request_streams: Mutex::new(HashMap::new()),
                store,
                grace: grace.map(GraceQueue::new),
                ping_interval,
                shutdown,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &ResumabilityStore {
        &self.shared.store
    }

    pub fn grace(&self) -> Option<&GraceQueue> {
        self.shared.grace.as_ref()
    }

    /// Open a stream and make it routable.
    ///
    /// The opening comment and any replayed history are queued before the
    /// stream is registered, so live messages always follow them.
    pub fn open(&self, params: OpenStream) -> (Arc<SseConnection>, SseStream) {
        let stream_id = generate_stream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let store = &self.shared.store;

        let mut history = Vec::new();
        let mut replay = Vec::new();
        if let Some(last_event_id) = params.last_event_id.as_deref() {
            history = store.adopt(params.session_id.as_ref(), last_event_id);
            replay = store.replay(&history, params.session_id.as_ref(), last_event_id);
        }

        let request_ids = params.pending.clone().unwrap_or_default();
        let connection = Arc::new(SseConnection {
            stream_id: stream_id.clone(),
            session_id: params.session_id,
            post_originated: params.pending.is_some(),
            opened_seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            cancel: self.shared.shutdown.child_token(),
            state: Mutex::new(ConnectionState {
                tx: Some(tx),
                pending: params.pending.map(|ids| ids.into_iter().collect()),
                last_event_id_sent: None,
                history,
            }),
        });

        let _ = connection.write_comment("stream opened");
        let mut replay_failed = false;
        if !replay.is_empty() {
            tracing::info!(
                stream_id = %stream_id,
                count = replay.len(),
                "replaying missed messages"
            );
            if let Err(e) = connection.replay(&replay) {
                tracing::warn!(stream_id = %stream_id, error = %e, "replay failed");
                replay_failed = true;
            }
        }

        {
            let mut routes = self.shared.request_streams.lock();
            for id in request_ids {
                routes.insert(id, stream_id.clone());
            }
        }
        let total = {
            let mut active = self.shared.active.lock();
            active.insert(stream_id.clone(), connection.clone());
            active.len()
        };
        tracing::info!(
            stream_id = %stream_id,
            session_id = ?connection.session_id,
            post = connection.post_originated,
            total,
            "SSE stream opened"
        );

        if replay_failed {
            self.cleanup(&stream_id, "Replay write error");
        } else {
            self.flush_parked(&connection);
            self.spawn_ping(&connection);
        }

        let guard = StreamGuard {
            shared: Arc::downgrade(&self.shared),
            stream_id,
        };
        let stream = UnboundedReceiverStream::new(rx)
            .map(move |event| {
                let _guard = &guard;
                Ok::<_, Infallible>(event)
            })
            .boxed();
        (connection, stream)
    }

    fn flush_parked(&self, connection: &SseConnection) {
        let (Some(grace), Some(session_id)) = (&self.shared.grace, &connection.session_id) else {
            return;
        };
        for message in grace.drain(session_id) {
            if let Err(e) = connection.write_message(&message, &self.shared.store) {
                tracing::warn!(
                    stream_id = %connection.stream_id,
                    error = %e,
                    "failed to flush parked response"
                );
                return;
            }
            tracing::debug!(
                stream_id = %connection.stream_id,
                request_id = ?message.id(),
                "delivered parked response"
            );
        }
    }

    fn spawn_ping(&self, connection: &Arc<SseConnection>) {
        let period = self.shared.ping_interval;
        if period.is_zero() {
            return;
        }
        let shared = Arc::downgrade(&self.shared);
        let connection = connection.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = connection.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = connection.write_comment("ping") {
                            tracing::debug!(
                                stream_id = %connection.stream_id,
                                error = %e,
                                "keepalive failed"
                            );
                            if let Some(shared) = shared.upgrade() {
                                ConnectionManager { shared }
                                    .cleanup(&connection.stream_id, "Ping error");
                            }
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Remove a stream, end its response and release its request ids.
    ///
    /// Returns `false` if the stream was already gone.
    pub fn cleanup(&self, stream_id: &str, reason: &str) -> bool {
        let Some(connection) = self.shared.active.lock().remove(stream_id) else {
            return false;
        };
        connection.cancel.cancel();
        let history = connection.close();

        let orphaned: Vec<RequestId> = {
            let mut routes = self.shared.request_streams.lock();
            let ids: Vec<RequestId> = routes
                .iter()
                .filter(|(_, s)| s.as_ref() == stream_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                routes.remove(id);
            }
            ids
        };
        if let (Some(grace), Some(session_id)) = (&self.shared.grace, &connection.session_id) {
            if !orphaned.is_empty() {
                grace.orphan(orphaned.iter().cloned(), session_id);
            }
        }
        self.shared
            .store
            .retire(connection.session_id.as_ref(), history);

        let remaining = self.shared.active.lock().len();
        tracing::info!(
            stream_id,
            session_id = ?connection.session_id,
            reason,
            orphaned = orphaned.len(),
            remaining,
            "SSE stream closed"
        );
        true
    }

    /// Close a POST stream once it owes no more responses.
    pub fn close_if_drained(&self, connection: &SseConnection) {
        if connection.is_drained() {
            self.cleanup(&connection.stream_id, "All responses delivered");
        }
    }

    /// Take the stream owed the response for `id`.
    pub fn take_route(&self, id: &RequestId) -> Option<Arc<SseConnection>> {
        let stream_id = self.shared.request_streams.lock().remove(id)?;
        let connection = self.shared.active.lock().get(&stream_id).cloned()?;
        connection.remove_pending(id);
        Some(connection)
    }

    pub fn is_routed(&self, id: &RequestId) -> bool {
        self.shared.request_streams.lock().contains_key(id)
    }

    /// Oldest open stream, preferring POST streams when `prefer_post` and GET
    /// streams otherwise.
    pub fn fallback(&self, prefer_post: bool) -> Option<Arc<SseConnection>> {
        let active = self.shared.active.lock();
        let preferred = active
            .values()
            .filter(|c| c.post_originated == prefer_post)
            .min_by_key(|c| c.opened_seq);
        preferred
            .or_else(|| active.values().min_by_key(|c| c.opened_seq))
            .cloned()
    }

    /// Oldest open stream of a session, GET streams first.
    pub fn fallback_for_session(&self, session_id: &SessionId) -> Option<Arc<SseConnection>> {
        let active = self.shared.active.lock();
        active
            .values()
            .filter(|c| c.session_id.as_ref() == Some(session_id))
            .min_by_key(|c| (c.post_originated, c.opened_seq))
            .cloned()
    }

    pub fn close_session(&self, session_id: &SessionId, reason: &str) -> usize {
        let streams: Vec<StreamId> = self
            .shared
            .active
            .lock()
            .values()
            .filter(|c| c.session_id.as_ref() == Some(session_id))
            .map(|c| c.stream_id.clone())
            .collect();
        streams
            .iter()
            .filter(|stream_id| self.cleanup(stream_id, reason))
            .count()
    }

    pub fn has_streams(&self, session_id: &SessionId) -> bool {
        self.shared
            .active
            .lock()
            .values()
            .any(|c| c.session_id.as_ref() == Some(session_id))
    }

    pub fn cleanup_all(&self, reason: &str) {
        let streams: Vec<StreamId> = self.shared.active.lock().keys().cloned().collect();
        for stream_id in streams {
            self.cleanup(&stream_id, reason);
        }
        self.shared.request_streams.lock().clear();
        if let Some(grace) = &self.shared.grace {
            grace.clear();
        }
    }

    pub fn count(&self) -> usize {
        self.shared.active.lock().len()
    }
}

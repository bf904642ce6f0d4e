//! Outbound message history for `Last-Event-ID` replay.
//!
//! Every message written to a stream while resumability is on gets an
//! [`EventId`]. Connection-local history always lives on the stream itself;
//! in [`ResumabilityMode::Global`] entries are also indexed per session so a
//! reconnect on any stream of that session can resume. In
//! [`ResumabilityMode::Connection`] the history of a closed stream is retired
//! here and adopted by the next stream that resumes from one of its ids.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::session::SessionId;
use crate::config::ResumabilityMode;

/// SSE event id, rendered as `<unix-millis>-<sequence>`.
///
/// The sequence is process-wide and strictly increasing and orders ids. The
/// timestamp still takes part in comparisons, so an id with a known sequence
/// but a foreign timestamp never matches a recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EventId {
    millis: u64,
    seq: u64,
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.seq, self.millis).cmp(&(other.seq, other.millis))
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EventId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s.trim().split_once('-').ok_or(())?;
        Ok(EventId {
            millis: millis.parse().map_err(|_| ())?,
            seq: seq.parse().map_err(|_| ())?,
        })
    }
}

/// One delivered message, kept as its encoded `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HistoryEntry {
    pub event_id: EventId,
    pub data: Arc<str>,
    pub recorded_at: Instant,
}

struct RetiredHistory {
    session_id: SessionId,
    entries: Vec<HistoryEntry>,
}

#[derive(Clone)]
pub(crate) struct ResumabilityStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    mode: ResumabilityMode,
    retention: Duration,
    seq: AtomicU64,
    global: Mutex<HashMap<SessionId, BTreeMap<EventId, HistoryEntry>>>,
    retired: Mutex<Vec<RetiredHistory>>,
}

impl ResumabilityStore {
    pub fn new(mode: ResumabilityMode, retention: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                mode,
                retention,
                seq: AtomicU64::new(0),
                global: Mutex::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.mode.is_enabled()
    }

    pub fn next_event_id(&self) -> EventId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        EventId {
            millis,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.inner.retention)
    }

    /// Append a delivered message to the connection history and, in global
    /// mode, to the session index.
    pub fn record(
        &self,
        local: &mut Vec<HistoryEntry>,
        session_id: Option<&SessionId>,
        entry: HistoryEntry,
    ) {
        if let Some(cutoff) = self.cutoff(entry.recorded_at) {
            local.retain(|e| e.recorded_at >= cutoff);
        }
        if self.inner.mode == ResumabilityMode::Global {
            if let Some(session_id) = session_id {
                self.inner
                    .global
                    .lock()
                    .entry(session_id.clone())
                    .or_default()
                    .insert(entry.event_id, entry.clone());
            }
        }
        local.push(entry);
    }

    /// Entries strictly after `last_event_id`, oldest first.
    ///
    /// An id that does not parse or is no longer retained yields nothing.
    pub fn replay(
        &self,
        local: &[HistoryEntry],
        session_id: Option<&SessionId>,
        last_event_id: &str,
    ) -> Vec<HistoryEntry> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let Ok(last) = last_event_id.parse::<EventId>() else {
            tracing::debug!(last_event_id, "unparseable Last-Event-ID, nothing to replay");
            return Vec::new();
        };

        if self.inner.mode == ResumabilityMode::Global {
            if let Some(session_id) = session_id {
                let global = self.inner.global.lock();
                let Some(history) = global.get(session_id) else {
                    return Vec::new();
                };
                if !history.contains_key(&last) {
                    return Vec::new();
                }
                return history
                    .range((std::ops::Bound::Excluded(last), std::ops::Bound::Unbounded))
                    .map(|(_, entry)| entry.clone())
                    .collect();
            }
        }

        match local.iter().position(|e| e.event_id == last) {
            Some(index) => local[index + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Keep the history of a closed stream so a reconnect can adopt it.
    pub fn retire(&self, session_id: Option<&SessionId>, entries: Vec<HistoryEntry>) {
        if self.inner.mode != ResumabilityMode::Connection || entries.is_empty() {
            return;
        }
        let Some(session_id) = session_id else {
            return;
        };
        self.inner.retired.lock().push(RetiredHistory {
            session_id: session_id.clone(),
            entries,
        });
    }

    /// Take over the retired history of `session_id` that contains
    /// `last_event_id`.
    pub fn adopt(&self, session_id: Option<&SessionId>, last_event_id: &str) -> Vec<HistoryEntry> {
        if self.inner.mode != ResumabilityMode::Connection {
            return Vec::new();
        }
        let (Some(session_id), Ok(last)) = (session_id, last_event_id.parse::<EventId>()) else {
            return Vec::new();
        };
        let mut retired = self.inner.retired.lock();
        let found = retired.iter().position(|r| {
            &r.session_id == session_id && r.entries.iter().any(|e| e.event_id == last)
        });
        match found {
            Some(index) => retired.swap_remove(index).entries,
            None => Vec::new(),
        }
    }

    /// Drop history older than the retention window. Returns the number of
    /// entries removed.
    pub fn prune(&self, now: Instant) -> usize {
        let Some(cutoff) = self.cutoff(now) else {
            return 0;
        };
        let mut removed = 0;

        let mut global = self.inner.global.lock();
        for history in global.values_mut() {
            let before = history.len();
            history.retain(|_, e| e.recorded_at >= cutoff);
            removed += before - history.len();
        }
        global.retain(|_, history| !history.is_empty());
        drop(global);

        let mut retired = self.inner.retired.lock();
        for history in retired.iter_mut() {
            let before = history.entries.len();
            history.entries.retain(|e| e.recorded_at >= cutoff);
            removed += before - history.entries.len();
        }
        retired.retain(|r| !r.entries.is_empty());

        if removed > 0 {
            tracing::debug!(removed, "pruned expired message history");
        }
        removed
    }

    pub fn forget_session(&self, session_id: &SessionId) {
        self.inner.global.lock().remove(session_id);
        self.inner
            .retired
            .lock()
            .retain(|r| &r.session_id != session_id);
    }

    pub fn clear(&self) {
        self.inner.global.lock().clear();
        self.inner.retired.lock().clear();
    }
}

//! Responses whose stream closed before they were produced.
//!
//! When a stream closes with requests still pending, their ids are remembered
//! as orphans of the stream's session. A response arriving for an orphan within
//! the grace period is parked for that session and flushed to the next stream
//! the session opens.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::session::SessionId;
use crate::jsonrpc::{Envelope, RequestId};

struct Orphan {
    session_id: SessionId,
    expires: Instant,
}

struct Parked {
    message: Envelope,
    expires: Instant,
}

pub(crate) struct GraceQueue {
    grace: Duration,
    orphans: Mutex<HashMap<RequestId, Orphan>>,
    parked: Mutex<HashMap<SessionId, Vec<Parked>>>,
}

impl GraceQueue {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            orphans: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn orphan(&self, ids: impl IntoIterator<Item = RequestId>, session_id: &SessionId) {
        let expires = Instant::now() + self.grace;
        let mut orphans = self.orphans.lock();
        for id in ids {
            orphans.insert(
                id,
                Orphan {
                    session_id: session_id.clone(),
                    expires,
                },
            );
        }
    }

    /// Session owning an orphaned request id, if still within grace.
    pub fn claim(&self, id: &RequestId) -> Option<SessionId> {
        let orphan = self.orphans.lock().remove(id)?;
        (orphan.expires > Instant::now()).then_some(orphan.session_id)
    }

    pub fn park(&self, session_id: &SessionId, message: Envelope) {
        self.parked
            .lock()
            .entry(session_id.clone())
            .or_default()
            .push(Parked {
                message,
                expires: Instant::now() + self.grace,
            });
    }

    /// Parked responses for `session_id` that have not expired, oldest first.
    pub fn drain(&self, session_id: &SessionId) -> Vec<Envelope> {
        let now = Instant::now();
        self.parked
            .lock()
            .remove(session_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.expires > now)
            .map(|p| p.message)
            .collect()
    }

    pub fn forget_session(&self, session_id: &SessionId) {
        self.orphans
            .lock()
            .retain(|_, o| &o.session_id != session_id);
        self.parked.lock().remove(session_id);
    }

    pub fn prune(&self, now: Instant) {
        self.orphans.lock().retain(|_, o| o.expires > now);
        let mut parked = self.parked.lock();
        for messages in parked.values_mut() {
            messages.retain(|p| p.expires > now);
        }
        parked.retain(|_, messages| !messages.is_empty());
    }

    #[cfg(test)]
    fn parked_count(&self) -> usize {
        self.parked.lock().values().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.orphans.lock().clear();
        self.parked.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_orphan_claim_within_grace() {
        let queue = GraceQueue::new(Duration::from_secs(5));
        let session: SessionId = Arc::from("s1");
        queue.orphan([RequestId::from(1_i64), RequestId::from(2_i64)], &session);

        assert_eq!(queue.claim(&RequestId::from(1_i64)), Some(session.clone()));
        // Claims are single use.
        assert_eq!(queue.claim(&RequestId::from(1_i64)), None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.claim(&RequestId::from(2_i64)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_messages_expire() {
        let queue = GraceQueue::new(Duration::from_secs(5));
        let session: SessionId = Arc::from("s1");
        queue.park(&session, Envelope::success(1_i64, json!("early")));
        tokio::time::advance(Duration::from_secs(3)).await;
        queue.park(&session, Envelope::success(2_i64, json!("late")));
        assert_eq!(queue.parked_count(), 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        let drained = queue.drain(&session);
        assert_eq!(drained, vec![Envelope::success(2_i64, json!("late"))]);
        assert!(queue.drain(&session).is_empty());
    }

    #[tokio::test]
    async fn test_forget_session() {
        let queue = GraceQueue::new(Duration::from_secs(5));
        let session: SessionId = Arc::from("s1");
        queue.orphan([RequestId::from("a")], &session);
        queue.park(&session, Envelope::success(1_i64, json!(null)));
        queue.forget_session(&session);
        assert_eq!(queue.claim(&RequestId::from("a")), None);
        assert_eq!(queue.parked_count(), 0);
    }
}

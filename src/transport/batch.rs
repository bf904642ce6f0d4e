//! Aggregation of responses for POSTs answered in batch mode.
//!
//! A batch completes exactly once: either every expected response arrived or
//! the timeout fired. Both paths race on the `completed` flag under the same
//! lock, and the loser does nothing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::jsonrpc::{Envelope, RequestId};

#[derive(Debug, PartialEq)]
pub(crate) enum BatchOutcome {
    /// All responses, in arrival order.
    Complete(Vec<Envelope>),
    /// Ids without a response, in request order.
    TimedOut { missing: Vec<RequestId> },
    /// The transport shut down before the batch completed.
    Closed,
}

struct BatchState {
    request_ids: Vec<RequestId>,
    expected: HashSet<RequestId>,
    responses: Vec<(RequestId, Envelope)>,
    completed: bool,
    responder: Option<oneshot::Sender<BatchOutcome>>,
    timer: Option<JoinHandle<()>>,
}

impl BatchState {
    fn finish(&mut self, outcome: BatchOutcome) {
        self.completed = true;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(outcome);
        }
    }
}

#[derive(Clone)]
pub(crate) struct BatchAggregator {
    shared: Arc<Shared>,
}

struct Shared {
    batches: Mutex<HashMap<u64, BatchState>>,
    next_id: AtomicU64,
    timeout: Duration,
}

/// Handle held by the POST handler while it waits.
///
/// Dropping it forgets the batch, e.g. when the client goes away.
pub(crate) struct PendingBatch {
    id: u64,
    rx: oneshot::Receiver<BatchOutcome>,
    aggregator: BatchAggregator,
}

impl PendingBatch {
    pub async fn wait(&mut self) -> BatchOutcome {
        (&mut self.rx).await.unwrap_or(BatchOutcome::Closed)
    }
}

impl Drop for PendingBatch {
    fn drop(&mut self) {
        self.aggregator.remove(self.id);
    }
}

impl BatchAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                batches: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    /// Start waiting for responses to `request_ids` and arm the timeout.
    pub fn open(&self, request_ids: Vec<RequestId>) -> PendingBatch {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let expected = request_ids.iter().cloned().collect();

        let shared = Arc::downgrade(&self.shared);
        let timeout = self.shared.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&shared, id);
        });

        tracing::debug!(batch_id = id, requests = request_ids.len(), "batch opened");
        self.shared.batches.lock().insert(
            id,
            BatchState {
                request_ids,
                expected,
                responses: Vec::new(),
                completed: false,
                responder: Some(tx),
                timer: Some(timer),
            },
        );
        PendingBatch {
            id,
            rx,
            aggregator: self.clone(),
        }
    }

    /// Offer a response to the open batches. Returns `true` if one claimed it.
    pub fn collect(&self, response: &Envelope) -> bool {
        let Some(id) = response.id() else {
            return false;
        };
        let mut batches = self.shared.batches.lock();
        let Some((batch_id, state)) = batches
            .iter_mut()
            .find(|(_, s)| !s.completed && s.expected.contains(id))
        else {
            return false;
        };

        match state.responses.iter_mut().find(|(rid, _)| rid == id) {
            Some(slot) => slot.1 = response.clone(),
            None => state.responses.push((id.clone(), response.clone())),
        }
        tracing::debug!(
            batch_id,
            request_id = %id,
            received = state.responses.len(),
            expected = state.expected.len(),
            "batch response collected"
        );

        if state.responses.len() == state.expected.len() {
            let responses = state.responses.drain(..).map(|(_, r)| r).collect();
            state.finish(BatchOutcome::Complete(responses));
        }
        true
    }

    /// Whether an uncompleted batch is waiting on `id`.
    pub fn is_tracking(&self, id: &RequestId) -> bool {
        self.shared
            .batches
            .lock()
            .values()
            .any(|s| !s.completed && s.expected.contains(id))
    }

    fn remove(&self, id: u64) {
        if let Some(mut state) = self.shared.batches.lock().remove(&id) {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }

    /// Abort every open batch; waiting handlers see [`BatchOutcome::Closed`].
    pub fn close_all(&self) {
        let drained: Vec<BatchState> = self.shared.batches.lock().drain().map(|(_, s)| s).collect();
        for mut state in drained {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .batches
            .lock()
            .values()
            .filter(|s| !s.completed)
            .count()
    }
}

fn expire(shared: &Weak<Shared>, id: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut batches = shared.batches.lock();
    let Some(state) = batches.get_mut(&id) else {
        return;
    };
    if state.completed {
        return;
    }
    let received: HashSet<&RequestId> = state.responses.iter().map(|(id, _)| id).collect();
    let missing: Vec<RequestId> = state
        .request_ids
        .iter()
        .filter(|id| !received.contains(id))
        .cloned()
        .collect();
    tracing::warn!(batch_id = id, missing = missing.len(), "batch timed out");
    state.timer = None;
    state.finish(BatchOutcome::TimedOut { missing });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(values: &[i64]) -> Vec<RequestId> {
        values.iter().map(|v| RequestId::from(*v)).collect()
    }

    #[tokio::test]
    async fn test_completes_in_arrival_order() {
        let aggregator = BatchAggregator::new(Duration::from_secs(30));
        let mut batch = aggregator.open(ids(&[1, 2]));
        assert!(aggregator.is_tracking(&RequestId::from(1_i64)));

        assert!(aggregator.collect(&Envelope::success(2_i64, json!("b"))));
        assert!(aggregator.collect(&Envelope::success(1_i64, json!("a"))));
        assert!(!aggregator.collect(&Envelope::success(3_i64, json!("c"))));

        assert_eq!(
            batch.wait().await,
            BatchOutcome::Complete(vec![
                Envelope::success(2_i64, json!("b")),
                Envelope::success(1_i64, json!("a")),
            ])
        );
        assert_eq!(aggregator.pending_count(), 0);
        drop(batch);
        assert!(!aggregator.is_tracking(&RequestId::from(1_i64)));
    }

    #[tokio::test]
    async fn test_duplicate_response_replaces_earlier() {
        let aggregator = BatchAggregator::new(Duration::from_secs(30));
        let mut batch = aggregator.open(ids(&[1, 2]));
        aggregator.collect(&Envelope::success(1_i64, json!("first")));
        aggregator.collect(&Envelope::success(1_i64, json!("second")));
        assert_eq!(aggregator.pending_count(), 1);
        aggregator.collect(&Envelope::success(2_i64, json!("other")));

        match batch.wait().await {
            BatchOutcome::Complete(responses) => {
                assert_eq!(responses.len(), 2);
                assert_eq!(responses[0], Envelope::success(1_i64, json!("second")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_missing_ids() {
        let aggregator = BatchAggregator::new(Duration::from_millis(100));
        let mut batch = aggregator.open(ids(&[1, 2, 3]));
        aggregator.collect(&Envelope::success(2_i64, json!(null)));

        assert_eq!(
            batch.wait().await,
            BatchOutcome::TimedOut {
                missing: ids(&[1, 3])
            }
        );
        // Late responses are not claimed by a finished batch.
        assert!(!aggregator.collect(&Envelope::success(1_i64, json!(null))));
    }

    #[tokio::test]
    async fn test_close_all_wakes_waiters() {
        let aggregator = BatchAggregator::new(Duration::from_secs(30));
        let mut batch = aggregator.open(ids(&[1]));
        aggregator.close_all();
        assert_eq!(batch.wait().await, BatchOutcome::Closed);
        assert_eq!(aggregator.pending_count(), 0);
    }
}

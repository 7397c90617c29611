//! Correlation table for in-flight network queries
//!
//! Every query registers a request id and a bounded channel. Responses
//! arriving through the gossip response handler are routed by request id
//! without blocking; anything for an unknown id is dropped. The entry is
//! removed when the query's [`PendingQuery`] is dropped, whether it finished
//! or was cancelled.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use policy_common::{PeerId, QueryResponse};

pub struct PendingQueries {
    inflight: DashMap<Uuid, mpsc::Sender<QueryResponse>>,
    buffer: usize,
}

impl PendingQueries {
    /// `buffer` bounds the responses queued for a single query
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            inflight: DashMap::new(),
            buffer: buffer.max(1),
        })
    }

    /// Open a new query context
    pub fn register(self: &Arc<Self>) -> PendingQuery {
        let request_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.inflight.insert(request_id, sender);
        PendingQuery {
            request_id,
            receiver,
            table: Arc::clone(self),
        }
    }

    /// Route a response to its query; `false` if it was dropped
    pub fn deliver(&self, response: QueryResponse) -> bool {
        let Some(sender) = self
            .inflight
            .get(&response.request_id)
            .map(|entry| entry.value().clone())
        else {
            debug!(request_id = %response.request_id, "Response for unknown or finished query dropped");
            return false;
        };

        match sender.try_send(response) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(response)) => {
                warn!(request_id = %response.request_id, "Query response buffer full, response dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Number of queries currently waiting for responses
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// Handle of one in-flight query
pub struct PendingQuery {
    request_id: Uuid,
    receiver: mpsc::Receiver<QueryResponse>,
    table: Arc<PendingQueries>,
}

impl PendingQuery {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Gather responses until `window` elapses
    ///
    /// Keeps one response per responder; repeated deliveries are discarded.
    /// Returns early once `enough` distinct stores answered. The deadline is
    /// never extended; whatever arrived by then is returned.
    pub async fn collect(mut self, window: Duration, enough: Option<usize>) -> Vec<QueryResponse> {
        let deadline = Instant::now() + window;
        let mut responders: HashSet<PeerId> = HashSet::new();
        let mut responses = Vec::new();

        loop {
            if enough.is_some_and(|enough| responders.len() >= enough) {
                break;
            }
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(response)) => {
                    if responders.insert(response.responder.clone()) {
                        responses.push(response);
                    } else {
                        debug!(
                            request_id = %self.request_id,
                            responder = %response.responder,
                            "Duplicate query response discarded"
                        );
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        debug!(
            request_id = %self.request_id,
            responses = responses.len(),
            "Query collection window closed"
        );
        responses
    }
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        self.table.inflight.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_common::Subject;

    fn response(request_id: Uuid, responder: &str) -> QueryResponse {
        QueryResponse {
            request_id,
            responder: PeerId::new(responder),
            subject: Subject::new("d1"),
            storage_nodes: Vec::new(),
            data_users: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_responses_routed_by_request_id() {
        let table = PendingQueries::new(8);
        let first = table.register();
        let second = table.register();

        assert!(table.deliver(response(first.request_id(), "P1")));
        assert!(table.deliver(response(second.request_id(), "P2")));
        assert!(table.deliver(response(first.request_id(), "P3")));

        let gathered = first.collect(Duration::from_millis(20), None).await;
        assert_eq!(gathered.len(), 2);
        assert!(gathered.iter().all(|r| r.responder != PeerId::new("P2")));
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_dropped() {
        let table = PendingQueries::new(8);
        assert!(!table.deliver(response(Uuid::new_v4(), "P1")));
    }

    #[tokio::test]
    async fn test_entry_removed_on_completion_and_cancellation() {
        let table = PendingQueries::new(8);

        let finished = table.register();
        let finished_id = finished.request_id();
        finished.collect(Duration::from_millis(5), None).await;
        assert!(!table.deliver(response(finished_id, "P1")));

        let cancelled = table.register();
        assert_eq!(table.len(), 1);
        drop(cancelled);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_collect_is_bounded_without_responses() {
        let table = PendingQueries::new(8);
        let started = Instant::now();
        let gathered = table.register().collect(Duration::from_millis(50), None).await;

        assert!(gathered.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_collect_returns_early_when_enough() {
        let table = PendingQueries::new(8);
        let query = table.register();
        table.deliver(response(query.request_id(), "P1"));

        let started = Instant::now();
        let gathered = query.collect(Duration::from_secs(30), Some(1)).await;
        assert_eq!(gathered.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_repeated_responses_count_once() {
        let table = PendingQueries::new(8);
        let query = table.register();
        table.deliver(response(query.request_id(), "P1"));
        table.deliver(response(query.request_id(), "P1"));
        table.deliver(response(query.request_id(), "P2"));

        let gathered = query.collect(Duration::from_secs(30), Some(2)).await;
        let responders: Vec<_> = gathered.iter().map(|r| r.responder.as_str()).collect();
        assert_eq!(responders, vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_excess() {
        let table = PendingQueries::new(1);
        let query = table.register();
        assert!(table.deliver(response(query.request_id(), "P1")));
        assert!(!table.deliver(response(query.request_id(), "P2")));
    }
}

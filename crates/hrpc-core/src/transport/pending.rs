//! Table of calls awaiting a response.
//!
//! Each entry is removed exactly once, by whichever of response delivery,
//! deadline expiry or connection failure gets to it first. Removal goes
//! through `DashMap::remove`, so two paths racing for the same id cannot both
//! complete it.

use crate::error::{Result, RpcError};
use crate::message::RpcResponse;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Delivers the outcome of one call to its waiter.
pub type ReplySender = oneshot::Sender<Result<RpcResponse>>;

struct PendingCall {
    connection_id: u64,
    started: Instant,
    timeout: Duration,
    deadline: Instant,
    reply: ReplySender,
}

impl PendingCall {
    fn finish(self, outcome: Result<RpcResponse>) {
        // The waiter may already have given up; nothing to deliver then.
        let _ = self.reply.send(outcome);
    }
}

/// Concurrent map of request id to pending call.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<u64, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call and return its deadline. Fails if the id is already
    /// pending.
    pub fn insert(
        &self,
        request_id: u64,
        connection_id: u64,
        timeout: Duration,
        reply: ReplySender,
    ) -> Result<Instant> {
        match self.calls.entry(request_id) {
            Entry::Occupied(_) => Err(RpcError::Protocol {
                message: format!("request id {} is already pending", request_id),
            }),
            Entry::Vacant(slot) => {
                let started = Instant::now();
                let deadline = started + timeout;
                slot.insert(PendingCall {
                    connection_id,
                    started,
                    timeout,
                    deadline,
                    reply,
                });
                Ok(deadline)
            }
        }
    }

    /// Complete a call with its response. Returns `false` if the id is not
    /// pending, e.g. because it already timed out.
    pub fn complete(&self, request_id: u64, outcome: Result<RpcResponse>) -> bool {
        match self.calls.remove(&request_id) {
            Some((_, call)) => {
                debug!(
                    "Request {} completed after {:?}",
                    request_id,
                    call.started.elapsed()
                );
                call.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail a call with a timeout. Returns `false` if it was no longer pending.
    pub fn expire(&self, request_id: u64) -> bool {
        match self.calls.remove(&request_id) {
            Some((_, call)) => {
                let after = call.timeout;
                debug!("Request {} timed out after {:?}", request_id, after);
                call.finish(Err(RpcError::Timeout { request_id, after }));
                true
            }
            None => false,
        }
    }

    /// Drop a call whose waiter went away. Returns `false` if it was not
    /// pending.
    pub fn cancel(&self, request_id: u64) -> bool {
        self.calls.remove(&request_id).is_some()
    }

    /// Fail every call whose deadline is at or before `now`.
    pub fn expire_elapsed(&self, now: Instant) -> usize {
        let due: Vec<u64> = self
            .calls
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        due.into_iter().filter(|id| self.expire(*id)).count()
    }

    /// Fail every call sent on `connection_id` with a connection error.
    pub fn fail_connection(&self, connection_id: u64, address: &str, message: &str) -> usize {
        let affected: Vec<u64> = self
            .calls
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for id in affected {
            if let Some((_, call)) = self
                .calls
                .remove_if(&id, |_, call| call.connection_id == connection_id)
            {
                call.finish(Err(RpcError::connection(address, message)));
                failed += 1;
            }
        }
        failed
    }

    /// Fail every pending call with `Shutdown`.
    pub fn fail_all(&self) -> usize {
        let ids: Vec<u64> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                call.finish(Err(RpcError::Shutdown));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.calls.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_with(
        table: &PendingCalls,
        id: u64,
        connection_id: u64,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<RpcResponse>> {
        let (tx, rx) = oneshot::channel();
        table.insert(id, connection_id, timeout, tx).unwrap();
        rx
    }

    #[tokio::test]
    async fn test_complete_delivers_response_once() {
        let table = PendingCalls::new();
        let rx = pending_with(&table, 1, 10, Duration::from_secs(5));

        assert!(table.complete(1, Ok(RpcResponse::success(1, json!("ok")))));
        assert!(!table.complete(1, Ok(RpcResponse::success(1, json!("again")))));
        assert!(table.is_empty());

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.into_result().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let table = PendingCalls::new();
        let _rx = pending_with(&table, 1, 10, Duration::from_secs(5));
        let (tx, _rx2) = oneshot::channel();
        assert!(table.insert(1, 10, Duration::from_secs(1), tx).is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_ids_resolve_independently() {
        let table = PendingCalls::new();
        let rx_a = pending_with(&table, 1, 10, Duration::from_secs(5));
        let rx_b = pending_with(&table, 2, 10, Duration::from_secs(5));

        assert!(table.complete(2, Ok(RpcResponse::success(2, json!("b")))));
        assert!(table.contains(1));

        assert!(table.complete(1, Ok(RpcResponse::success(1, json!("a")))));
        assert_eq!(rx_a.await.unwrap().unwrap().request_id(), 1);
        assert_eq!(rx_b.await.unwrap().unwrap().request_id(), 2);
    }

    #[tokio::test]
    async fn test_late_response_after_expiry_is_discarded() {
        let table = PendingCalls::new();
        let rx = pending_with(&table, 5, 10, Duration::from_millis(50));

        assert!(table.expire(5));
        assert!(!table.complete(5, Ok(RpcResponse::success(5, json!("late")))));

        match rx.await.unwrap() {
            Err(RpcError::Timeout { request_id, after }) => {
                assert_eq!(request_id, 5);
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("Expected Timeout, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expire_elapsed_only_removes_due_calls() {
        let table = PendingCalls::new();
        let _short = pending_with(&table, 1, 10, Duration::ZERO);
        let _long = pending_with(&table, 2, 10, Duration::from_secs(60));

        assert_eq!(table.expire_elapsed(Instant::now()), 1);
        assert!(!table.contains(1));
        assert!(table.contains(2));
    }

    #[tokio::test]
    async fn test_fail_connection_only_affects_its_calls() {
        let table = PendingCalls::new();
        let rx_a = pending_with(&table, 1, 10, Duration::from_secs(5));
        let rx_b = pending_with(&table, 2, 11, Duration::from_secs(5));

        assert_eq!(table.fail_connection(10, "127.0.0.1:9000", "reset"), 1);
        assert!(matches!(
            rx_a.await.unwrap(),
            Err(RpcError::Connection { .. })
        ));
        assert!(table.contains(2));

        assert_eq!(table.fail_all(), 1);
        assert!(matches!(rx_b.await.unwrap(), Err(RpcError::Shutdown)));
    }
}

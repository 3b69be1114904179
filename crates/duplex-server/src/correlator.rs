//! Matches pushed requests to the responses clients submit.
//!
//! Each in-flight request owns one entry in the pending map. An entry leaves
//! the map exactly once, by whichever of resolve, timeout, cancel, or drop
//! removes it first:
//!
//! ```text
//! PENDING ──resolve──► RESOLVED
//!    ├────deadline───► TIMED_OUT
//!    └──cancel_session► CANCELLED
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use duplex_core::{CancelReason, ClientId, RelayError, RequestId, Response, SubmitOutcome};
use tokio::sync::oneshot;
use tokio::time::Instant;

type Resolution = Result<Response, CancelReason>;

#[derive(Debug)]
struct PendingEntry {
    owner: ClientId,
    generation: u64,
    slot: oneshot::Sender<Resolution>,
}

/// Pending-request table shared by dispatchers and the submission path.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Arc<DashMap<RequestId, PendingEntry>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a PENDING entry for `request_id`, owned by the session with
    /// the given generation.
    ///
    /// Must be called before the request becomes visible to the client, so a
    /// fast response cannot arrive ahead of its entry.
    pub fn register(
        &self,
        request_id: RequestId,
        owner: ClientId,
        generation: u64,
        deadline: Instant,
    ) -> PendingResponse {
        let (slot, rx) = oneshot::channel();
        let previous = self.pending.insert(
            request_id.clone(),
            PendingEntry {
                owner,
                generation,
                slot,
            },
        );
        if previous.is_some() {
            tracing::error!(request_id = %request_id, "Request id reused while still pending");
            debug_assert!(previous.is_none(), "request id collision: {request_id}");
        }

        PendingResponse {
            request_id,
            deadline,
            started: Instant::now(),
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Register and wait in one step.
    pub async fn await_response(
        &self,
        request_id: RequestId,
        owner: ClientId,
        generation: u64,
        deadline: Instant,
    ) -> Result<Response, RelayError> {
        self.register(request_id, owner, generation, deadline).wait().await
    }

    /// Deliver `response` to the waiter that owns its id.
    ///
    /// Unknown ids, ids already resolved, and ids pending for a different
    /// client are all `Unmatched`.
    pub fn resolve(&self, owner: &ClientId, response: Response) -> SubmitOutcome {
        let Some((request_id, entry)) = self.pending.remove_if(&response.id, |_, e| &e.owner == owner) else {
            tracing::debug!(
                client_id = %owner,
                request_id = %response.id,
                "No pending request for response, dropping"
            );
            return SubmitOutcome::Unmatched;
        };

        if entry.slot.send(Ok(response)).is_err() {
            tracing::debug!(request_id = %request_id, "Waiter gone before response was delivered");
            return SubmitOutcome::Unmatched;
        }
        SubmitOutcome::Delivered
    }

    /// Fail every PENDING entry owned by one session generation.
    pub fn cancel_session(&self, generation: u64, reason: CancelReason) -> usize {
        self.cancel_where(|e| e.generation == generation, reason)
    }

    /// Fail every PENDING entry.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        self.cancel_where(|_| true, reason)
    }

    fn cancel_where(&self, matches: impl Fn(&PendingEntry) -> bool, reason: CancelReason) -> usize {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove_if(&id, |_, e| matches(e)) {
                let _ = entry.slot.send(Err(reason));
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The caller's side of one PENDING entry.
///
/// Dropping it withdraws the entry, so an abandoned dispatch does not leave
/// state behind.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: RequestId,
    deadline: Instant,
    started: Instant,
    rx: oneshot::Receiver<Resolution>,
    pending: Arc<DashMap<RequestId, PendingEntry>>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until resolved, cancelled, or the deadline passes.
    pub async fn wait(mut self) -> Result<Response, RelayError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(resolution) => Self::settle(resolution),
            Err(_elapsed) => {
                if self.pending.remove(&self.request_id).is_some() {
                    tracing::debug!(request_id = %self.request_id, "Request timed out");
                    return Err(RelayError::Timeout(self.deadline.saturating_duration_since(self.started)));
                }
                // Someone else removed the entry first; their value is on its way.
                let resolution = (&mut self.rx).await;
                Self::settle(resolution)
            }
        }
    }

    fn settle(resolution: Result<Resolution, oneshot::error::RecvError>) -> Result<Response, RelayError> {
        match resolution {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(RelayError::Cancelled(reason)),
            Err(_) => Err(RelayError::Cancelled(CancelReason::Disconnected)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client() -> ClientId {
        ClientId::from_raw("c1")
    }

    fn rid(s: &str) -> RequestId {
        RequestId::from_raw(s)
    }

    fn in_secs(n: u64) -> Instant {
        Instant::now() + Duration::from_secs(n)
    }

    #[tokio::test]
    async fn resolve_delivers_response() {
        let correlator = Correlator::new();
        let pending = correlator.register(rid("req_1"), client(), 1, in_secs(5));
        assert_eq!(correlator.len(), 1);

        let outcome = correlator.resolve(&client(), Response::success(rid("req_1"), "done"));
        assert_eq!(outcome, SubmitOutcome::Delivered);

        let resp = pending.wait().await.unwrap();
        assert_eq!(resp.result_str(), Some("done"));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn second_resolve_is_unmatched() {
        let correlator = Correlator::new();
        let pending = correlator.register(rid("req_1"), client(), 1, in_secs(5));

        assert_eq!(
            correlator.resolve(&client(), Response::success(rid("req_1"), "first")),
            SubmitOutcome::Delivered
        );
        assert_eq!(
            correlator.resolve(&client(), Response::success(rid("req_1"), "second")),
            SubmitOutcome::Unmatched
        );

        assert_eq!(pending.wait().await.unwrap().result_str(), Some("first"));
    }

    #[test]
    fn unknown_id_is_unmatched() {
        let correlator = Correlator::new();
        let outcome = correlator.resolve(&client(), Response::success(rid("nope"), "x"));
        assert_eq!(outcome, SubmitOutcome::Unmatched);
    }

    #[tokio::test]
    async fn response_from_other_client_is_unmatched() {
        let correlator = Correlator::new();
        let _pending = correlator.register(rid("req_1"), client(), 1, in_secs(5));

        let outcome = correlator.resolve(&ClientId::from_raw("intruder"), Response::success(rid("req_1"), "x"));
        assert_eq!(outcome, SubmitOutcome::Unmatched);
        assert!(correlator.is_pending(&rid("req_1")));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_and_removes_entry() {
        let correlator = Correlator::new();
        let start = Instant::now();

        let err = correlator
            .await_response(rid("req_1"), client(), 1, start + Duration::from_secs(2))
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::Timeout(Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(correlator.is_empty());

        let late = correlator.resolve(&client(), Response::success(rid("req_1"), "late"));
        assert_eq!(late, SubmitOutcome::Unmatched);
    }

    #[tokio::test]
    async fn cancel_session_fails_only_its_entries() {
        let correlator = Correlator::new();
        let a = correlator.register(rid("a"), client(), 1, in_secs(5));
        let b = correlator.register(rid("b"), client(), 1, in_secs(5));
        let other = correlator.register(rid("c"), ClientId::from_raw("c2"), 2, in_secs(5));

        assert_eq!(correlator.cancel_session(1, CancelReason::Replaced), 2);
        assert_eq!(a.wait().await.unwrap_err(), RelayError::Cancelled(CancelReason::Replaced));
        assert_eq!(b.wait().await.unwrap_err(), RelayError::Cancelled(CancelReason::Replaced));

        assert!(correlator.is_pending(&rid("c")));
        drop(other);
    }

    #[tokio::test]
    async fn cancel_all_reports_reason() {
        let correlator = Correlator::new();
        let a = correlator.register(rid("a"), client(), 1, in_secs(5));
        assert_eq!(correlator.cancel_all(CancelReason::Shutdown), 1);
        assert_eq!(a.wait().await.unwrap_err(), RelayError::Cancelled(CancelReason::Shutdown));
    }

    #[tokio::test]
    async fn dropping_pending_withdraws_entry() {
        let correlator = Correlator::new();
        let pending = correlator.register(rid("req_1"), client(), 1, in_secs(5));
        assert!(correlator.is_pending(&rid("req_1")));

        drop(pending);
        assert!(correlator.is_empty());
        assert_eq!(
            correlator.resolve(&client(), Response::success(rid("req_1"), "x")),
            SubmitOutcome::Unmatched
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_have_one_winner() {
        for round in 0..50 {
            let correlator = Arc::new(Correlator::new());
            let id = rid(&format!("req_{round}"));
            let pending = correlator.register(id.clone(), client(), 1, in_secs(5));

            let handles: Vec<_> = (0..4)
                .map(|n| {
                    let correlator = Arc::clone(&correlator);
                    let id = id.clone();
                    tokio::spawn(async move { correlator.resolve(&client(), Response::success(id, format!("r{n}"))) })
                })
                .collect();

            let mut delivered = 0;
            for handle in handles {
                if handle.await.unwrap() == SubmitOutcome::Delivered {
                    delivered += 1;
                }
            }
            assert_eq!(delivered, 1, "round {round}");
            assert!(pending.wait().await.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_racing_timeout_has_one_winner() {
        let correlator = Arc::new(Correlator::new());
        let deadline = Instant::now() + Duration::from_millis(100);
        let pending = correlator.register(rid("req_1"), client(), 1, deadline);

        let resolver = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                correlator.resolve(&client(), Response::success(rid("req_1"), "edge"))
            })
        };

        let result = pending.wait().await;
        let outcome = resolver.await.unwrap();
        match outcome {
            SubmitOutcome::Delivered => assert_eq!(result.unwrap().result_str(), Some("edge")),
            SubmitOutcome::Unmatched => assert!(matches!(result, Err(RelayError::Timeout(_)))),
        }
        assert!(correlator.is_empty());
    }
}

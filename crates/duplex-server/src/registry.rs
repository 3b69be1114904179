use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use duplex_core::{CancelReason, ClientId, RelayError, Request};
use parking_lot::Mutex;

use crate::correlator::Correlator;
use crate::session::{PushReceiver, Session};

/// Registry of connected clients, at most one live [`Session`] per id.
///
/// One lock covers the map and every session's open/terminate transition, so
/// an enqueue can never land on a session that is mid-teardown.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ClientId, Arc<Session>>>,
    correlator: Arc<Correlator>,
    push_capacity: usize,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(correlator: Arc<Correlator>, push_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            correlator,
            push_capacity,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Install a new session for `client_id`, superseding any existing one.
    ///
    /// A replaced session has its push stream closed and its pending requests
    /// fail with [`CancelReason::Replaced`]. Returns the new session, its push
    /// receiver, and whether a previous session was replaced.
    pub fn register(&self, client_id: ClientId) -> (Arc<Session>, PushReceiver, bool) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (session, receiver) = Session::open(client_id.clone(), generation, self.push_capacity);

        let mut sessions = self.sessions.lock();
        let replaced = sessions.insert(client_id.clone(), Arc::clone(&session));
        if let Some(old) = &replaced {
            self.terminate(old, CancelReason::Replaced);
            tracing::info!(
                client_id = %client_id,
                old_generation = old.generation(),
                new_generation = generation,
                "Client reconnected, replaced previous session"
            );
        }
        drop(sessions);

        (session, receiver, replaced.is_some())
    }

    /// Remove whatever session is registered for `client_id`. Idempotent.
    pub fn unregister(&self, client_id: &ClientId) -> bool {
        self.remove_if(client_id, |_| true, CancelReason::Disconnected)
    }

    /// Remove the session only if it is still the given generation.
    ///
    /// Stream tasks use this on exit so a stale stream never tears down the
    /// connection that replaced it.
    pub fn unregister_session(&self, client_id: &ClientId, generation: u64) -> bool {
        self.remove_if(client_id, |s| s.generation() == generation, CancelReason::Disconnected)
    }

    fn remove_if(&self, client_id: &ClientId, pred: impl Fn(&Session) -> bool, reason: CancelReason) -> bool {
        let mut sessions = self.sessions.lock();
        let matches = sessions.get(client_id).is_some_and(|s| pred(s.as_ref()));
        if !matches {
            return false;
        }
        if let Some(session) = sessions.remove(client_id) {
            self.terminate(&session, reason);
        }
        true
    }

    pub fn lookup(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        self.sessions.lock().get(client_id).cloned()
    }

    /// Enqueue onto a specific session's push queue.
    pub fn enqueue(&self, session: &Session, request: Request) -> Result<(), RelayError> {
        let _sessions = self.sessions.lock();
        session.try_push(request)
    }

    /// Terminate every session, e.g. on shutdown.
    pub fn close_all(&self, reason: CancelReason) -> usize {
        let mut sessions = self.sessions.lock();
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            self.terminate(&session, reason);
        }
        count
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// All live sessions, sorted by client id.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut all: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        all.sort_by(|a, b| a.client_id().as_str().cmp(b.client_id().as_str()));
        all
    }

    fn terminate(&self, session: &Session, reason: CancelReason) {
        session.terminate(reason);
        let cancelled = self.correlator.cancel_session(session.generation(), reason);
        tracing::debug!(
            client_id = %session.client_id(),
            generation = session.generation(),
            cancelled,
            reason = %reason,
            "Session terminated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::{Payload, RequestId};
    use std::time::Duration;
    use tokio::time::Instant;

    fn registry(capacity: usize) -> (SessionRegistry, Arc<Correlator>) {
        let correlator = Arc::new(Correlator::new());
        (SessionRegistry::new(Arc::clone(&correlator), capacity), correlator)
    }

    fn cid(s: &str) -> ClientId {
        ClientId::from_raw(s)
    }

    fn request(n: u32) -> Request {
        Request::new(RequestId::from_raw(format!("req_{n}")), Payload::new("analyze", "x"))
    }

    #[test]
    fn register_lookup_unregister() {
        let (registry, _) = registry(4);
        assert_eq!(registry.count(), 0);

        let (_s1, _rx1, replaced) = registry.register(cid("c1"));
        assert!(!replaced);
        let (_s2, _rx2, _) = registry.register(cid("c2"));
        assert_eq!(registry.count(), 2);
        assert!(registry.lookup(&cid("c1")).is_some());

        assert!(registry.unregister(&cid("c1")));
        assert!(registry.lookup(&cid("c1")).is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let (registry, _) = registry(4);
        let (session, _rx, _) = registry.register(cid("c1"));

        assert!(registry.unregister(&cid("c1")));
        assert!(!registry.unregister(&cid("c1")));
        assert!(!registry.unregister(&cid("never")));
        assert!(session.is_terminated());
        assert_eq!(session.termination_reason(), Some(CancelReason::Disconnected));
    }

    #[tokio::test]
    async fn reregister_replaces_and_cancels_pending() {
        let (registry, correlator) = registry(4);
        let (old, mut old_rx, _) = registry.register(cid("c1"));
        let pending = correlator.register(
            RequestId::from_raw("req_1"),
            cid("c1"),
            old.generation(),
            Instant::now() + Duration::from_secs(5),
        );

        let (new, _new_rx, replaced) = registry.register(cid("c1"));
        assert!(replaced);
        assert_ne!(old.generation(), new.generation());
        assert_eq!(registry.count(), 1);

        assert!(old.is_terminated());
        assert_eq!(old.termination_reason(), Some(CancelReason::Replaced));
        assert!(old_rx.next().await.is_none());
        assert_eq!(
            pending.wait().await.unwrap_err(),
            RelayError::Cancelled(CancelReason::Replaced)
        );

        let current = registry.lookup(&cid("c1")).unwrap();
        assert_eq!(current.generation(), new.generation());
    }

    #[test]
    fn stale_generation_does_not_unregister_replacement() {
        let (registry, _) = registry(4);
        let (old, _old_rx, _) = registry.register(cid("c1"));
        let (new, _new_rx, _) = registry.register(cid("c1"));

        assert!(!registry.unregister_session(&cid("c1"), old.generation()));
        assert!(registry.lookup(&cid("c1")).is_some());

        assert!(registry.unregister_session(&cid("c1"), new.generation()));
        assert!(registry.lookup(&cid("c1")).is_none());
    }

    #[tokio::test]
    async fn enqueue_preserves_order() {
        let (registry, _) = registry(8);
        let (session, mut rx, _) = registry.register(cid("c1"));
        for n in 1..=3 {
            registry.enqueue(&session, request(n)).unwrap();
        }
        for n in 1..=3 {
            assert_eq!(rx.next().await.unwrap().id.as_str(), format!("req_{n}"));
        }
    }

    #[test]
    fn enqueue_full_is_backpressure() {
        let (registry, _) = registry(1);
        let (session, _rx, _) = registry.register(cid("c1"));
        registry.enqueue(&session, request(1)).unwrap();
        assert_eq!(
            registry.enqueue(&session, request(2)).unwrap_err(),
            RelayError::Backpressure(cid("c1"))
        );
    }

    #[test]
    fn enqueue_after_unregister_is_cancelled() {
        let (registry, _) = registry(4);
        let (session, _rx, _) = registry.register(cid("c1"));
        registry.unregister(&cid("c1"));
        assert_eq!(
            registry.enqueue(&session, request(1)).unwrap_err(),
            RelayError::Cancelled(CancelReason::Disconnected)
        );
    }

    #[test]
    fn close_all_terminates_everything() {
        let (registry, _) = registry(4);
        let (a, _ra, _) = registry.register(cid("a"));
        let (b, _rb, _) = registry.register(cid("b"));

        assert_eq!(registry.close_all(CancelReason::Shutdown), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(a.termination_reason(), Some(CancelReason::Shutdown));
        assert_eq!(b.termination_reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn sessions_sorted_by_client_id() {
        let (registry, _) = registry(4);
        let (_b, _rb, _) = registry.register(cid("b"));
        let (_a, _ra, _) = registry.register(cid("a"));
        let ids: Vec<String> = registry.sessions().iter().map(|s| s.client_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}

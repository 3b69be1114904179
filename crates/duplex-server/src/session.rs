use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use duplex_core::{CancelReason, ClientId, RelayError, Request};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Server-side state for one connected client.
///
/// Owns the sending half of the client's push queue. The receiving half is a
/// [`PushReceiver`] held by the stream task that writes to the peer.
#[derive(Debug)]
pub struct Session {
    client_id: ClientId,
    generation: u64,
    connected_at: DateTime<Utc>,
    capacity: usize,
    push_tx: mpsc::Sender<Request>,
    closed: CancellationToken,
    reason: OnceLock<CancelReason>,
}

impl Session {
    pub(crate) fn open(client_id: ClientId, generation: u64, capacity: usize) -> (Arc<Self>, PushReceiver) {
        let capacity = capacity.max(1);
        let (push_tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        let session = Arc::new(Self {
            client_id: client_id.clone(),
            generation,
            connected_at: Utc::now(),
            capacity,
            push_tx,
            closed: closed.clone(),
            reason: OnceLock::new(),
        });
        let receiver = PushReceiver {
            client_id,
            generation,
            rx,
            closed,
        };
        (session, receiver)
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Unique across every session this process has created.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Requests waiting to be written to the peer.
    pub fn queued(&self) -> usize {
        self.capacity - self.push_tx.capacity()
    }

    pub fn is_terminated(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn termination_reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Non-blocking enqueue. Callers hold the registry lock so this cannot
    /// interleave with [`Session::terminate`].
    pub(crate) fn try_push(&self, request: Request) -> Result<(), RelayError> {
        if self.is_terminated() {
            return Err(RelayError::Cancelled(
                self.termination_reason().unwrap_or(CancelReason::Disconnected),
            ));
        }
        match self.push_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    request_id = %req.id,
                    capacity = self.capacity,
                    "Push queue full, rejecting request"
                );
                Err(RelayError::Backpressure(self.client_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::Cancelled(CancelReason::Disconnected)),
        }
    }

    /// Stop the session. The first reason recorded wins.
    pub(crate) fn terminate(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.closed.cancel();
    }
}

/// Draining half of a session's push queue.
#[derive(Debug)]
pub struct PushReceiver {
    client_id: ClientId,
    generation: u64,
    rx: mpsc::Receiver<Request>,
    closed: CancellationToken,
}

impl PushReceiver {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next request in enqueue order. Waits while the queue is empty and
    /// returns `None` once the session is torn down.
    pub async fn next(&mut self) -> Option<Request> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            req = self.rx.recv() => req,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::{Payload, RequestId};

    fn request(n: u32) -> Request {
        Request::new(RequestId::from_raw(format!("req_{n}")), Payload::new("analyze", format!("m{n}")))
    }

    #[tokio::test]
    async fn push_and_drain_in_order() {
        let (session, mut rx) = Session::open(ClientId::from_raw("c1"), 1, 8);
        for n in 1..=3 {
            session.try_push(request(n)).unwrap();
        }
        assert_eq!(session.queued(), 3);

        for n in 1..=3 {
            let req = rx.next().await.unwrap();
            assert_eq!(req.id.as_str(), format!("req_{n}"));
        }
        assert_eq!(session.queued(), 0);
    }

    #[test]
    fn full_queue_is_backpressure() {
        let (session, _rx) = Session::open(ClientId::from_raw("c1"), 1, 2);
        session.try_push(request(1)).unwrap();
        session.try_push(request(2)).unwrap();

        let err = session.try_push(request(3)).unwrap_err();
        assert_eq!(err, RelayError::Backpressure(ClientId::from_raw("c1")));
    }

    #[tokio::test]
    async fn terminate_ends_receiver_and_rejects_pushes() {
        let (session, mut rx) = Session::open(ClientId::from_raw("c1"), 1, 4);
        session.try_push(request(1)).unwrap();
        session.terminate(CancelReason::Replaced);

        assert!(rx.next().await.is_none());
        assert!(session.is_terminated());
        assert_eq!(
            session.try_push(request(2)).unwrap_err(),
            RelayError::Cancelled(CancelReason::Replaced)
        );
    }

    #[test]
    fn first_termination_reason_wins() {
        let (session, _rx) = Session::open(ClientId::from_raw("c1"), 1, 4);
        session.terminate(CancelReason::Shutdown);
        session.terminate(CancelReason::Disconnected);
        assert_eq!(session.termination_reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn dropped_receiver_reports_disconnect() {
        let (session, rx) = Session::open(ClientId::from_raw("c1"), 1, 4);
        drop(rx);
        assert_eq!(
            session.try_push(request(1)).unwrap_err(),
            RelayError::Cancelled(CancelReason::Disconnected)
        );
    }
}

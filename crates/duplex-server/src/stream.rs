use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::Event;
use duplex_core::{ClientId, Notice, Request};
use futures::stream::{self, Stream, StreamExt};

use crate::relay::Relay;
use crate::session::PushReceiver;

/// Releases the session when the SSE body is dropped, whether the peer went
/// away, a write failed, or the session was terminated.
pub struct SessionGuard {
    relay: Arc<Relay>,
    client_id: ClientId,
    generation: u64,
}

impl SessionGuard {
    pub fn new(relay: Arc<Relay>, receiver: &PushReceiver) -> Self {
        Self {
            relay,
            client_id: receiver.client_id().clone(),
            generation: receiver.generation(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        tracing::debug!(
            client_id = %self.client_id,
            generation = self.generation,
            "Push stream closed"
        );
        self.relay.release(&self.client_id, self.generation);
    }
}

/// Encode the opening record that tells the client its id.
pub fn client_id_event(client_id: &ClientId) -> Option<Event> {
    let notice = Notice::ClientId {
        id: client_id.clone(),
    };
    serde_json::to_string(&notice)
        .ok()
        .map(|json| Event::default().data(json))
}

/// Encode one pushed request as an SSE `data:` record.
pub fn request_event(request: &Request) -> Option<Event> {
    match serde_json::to_string(request) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            tracing::error!(request_id = %request.id, error = %e, "Failed to encode request");
            None
        }
    }
}

/// The session's drain loop as an SSE body: the client-id record, then every
/// request in enqueue order until the session ends.
pub fn push_stream(
    receiver: PushReceiver,
    guard: SessionGuard,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let hello = client_id_event(receiver.client_id());

    let requests = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        let request = receiver.next().await?;
        tracing::debug!(
            client_id = %receiver.client_id(),
            request_id = %request.id,
            "Writing request to push stream"
        );
        Some((request_event(&request), (receiver, guard)))
    });

    stream::iter(hello)
        .chain(requests.filter_map(|event| async move { event }))
        .map(Ok)
}

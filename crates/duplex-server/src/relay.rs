//! The relay: dispatch requests to connected clients and accept their
//! responses.
//!
//! ```text
//! dispatch ─► registry.lookup ─► correlator.register ─► session push queue ─► SSE stream
//!    ▲                                                                            │
//!    └──────────── correlator.resolve ◄── submit ◄── POST /response ◄─────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use duplex_core::{
    CancelReason, ClientId, IdGenerator, Payload, RelayError, Request, Response, SubmitOutcome,
};
use duplex_telemetry::MetricsRecorder;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::correlator::Correlator;
use crate::registry::SessionRegistry;
use crate::session::{PushReceiver, Session};

pub const METRIC_DISPATCH_TOTAL: &str = "relay_dispatch_total";
pub const METRIC_SUBMIT_TOTAL: &str = "relay_submit_total";
pub const METRIC_SESSION_EVENTS: &str = "relay_session_events_total";
pub const METRIC_CONNECTED_CLIENTS: &str = "relay_connected_clients";
pub const METRIC_ROUND_TRIP_MS: &str = "relay_round_trip_ms";

/// Deadline used when `now + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub struct Relay {
    registry: SessionRegistry,
    correlator: Arc<Correlator>,
    ids: Box<dyn IdGenerator>,
    metrics: Arc<MetricsRecorder>,
}

impl Relay {
    pub fn new(push_capacity: usize, ids: Box<dyn IdGenerator>, metrics: Arc<MetricsRecorder>) -> Self {
        let correlator = Arc::new(Correlator::new());
        Self {
            registry: SessionRegistry::new(Arc::clone(&correlator), push_capacity),
            correlator,
            ids,
            metrics,
        }
    }

    pub fn from_config(config: &ServerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self::new(config.push_queue_capacity, config.id_strategy.generator(), metrics)
    }

    /// Open a session. A missing id gets a generated `client_<uuid>` one.
    pub fn connect(&self, client_id: Option<ClientId>) -> (Arc<Session>, PushReceiver) {
        let client_id = client_id.unwrap_or_default();
        let (session, receiver, replaced) = self.registry.register(client_id.clone());

        self.record_session_event("connected");
        if replaced {
            self.record_session_event("replaced");
        }
        self.update_client_gauge();
        tracing::info!(client_id = %client_id, generation = session.generation(), "Client connected");

        (session, receiver)
    }

    /// Unregister whatever session `client_id` has.
    pub fn disconnect(&self, client_id: &ClientId) -> bool {
        let removed = self.registry.unregister(client_id);
        if removed {
            self.on_disconnected(client_id);
        }
        removed
    }

    /// Unregister a session only if it is still the current one for its id.
    pub fn release(&self, client_id: &ClientId, generation: u64) -> bool {
        let removed = self.registry.unregister_session(client_id, generation);
        if removed {
            self.on_disconnected(client_id);
        }
        removed
    }

    pub fn lookup(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        self.registry.lookup(client_id)
    }

    /// Push `payload` to `client_id` and wait up to `timeout` for its response.
    ///
    /// Fails immediately with `ClientNotFound` or `Backpressure`; otherwise
    /// suspends until the client responds (`Ok`), the wait elapses
    /// (`Timeout`), or the session ends (`Cancelled`).
    #[tracing::instrument(skip(self, payload), fields(method = %payload.method))]
    pub async fn dispatch(
        &self,
        client_id: &ClientId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Response, RelayError> {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let result = self.dispatch_inner(client_id, payload, deadline).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_kind(),
        };
        self.metrics
            .increment_counter(METRIC_DISPATCH_TOTAL, &[("outcome", outcome)], 1);
        if result.is_ok() {
            self.metrics.observe(
                METRIC_ROUND_TRIP_MS,
                &[],
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        if let Err(e) = &result {
            tracing::info!(error_kind = e.error_kind(), error = %e, "Dispatch failed");
        }
        result
    }

    async fn dispatch_inner(
        &self,
        client_id: &ClientId,
        payload: Payload,
        deadline: Instant,
    ) -> Result<Response, RelayError> {
        let session = self
            .registry
            .lookup(client_id)
            .ok_or_else(|| RelayError::ClientNotFound(client_id.clone()))?;

        let request = Request::new(self.ids.next_request_id(), payload);
        let request_id = request.id.clone();

        let pending = self
            .correlator
            .register(request_id.clone(), client_id.clone(), session.generation(), deadline);

        // A failed enqueue drops `pending`, which withdraws the entry.
        self.registry.enqueue(&session, request)?;
        tracing::debug!(request_id = %request_id, "Request queued for client");

        pending.wait().await
    }

    /// Accept a client's response.
    ///
    /// The acknowledgement does not depend on whether a dispatch was still
    /// waiting: late or unknown ids come back as `Unmatched`.
    pub fn submit(&self, client_id: &ClientId, response: Response) -> Result<SubmitOutcome, RelayError> {
        if self.registry.lookup(client_id).is_none() {
            self.metrics
                .increment_counter(METRIC_SUBMIT_TOTAL, &[("outcome", "unknown_client")], 1);
            tracing::warn!(client_id = %client_id, request_id = %response.id, "Response from unknown client");
            return Err(RelayError::UnknownClient(client_id.clone()));
        }

        let request_id = response.id.clone();
        let outcome = self.correlator.resolve(client_id, response);
        self.metrics
            .increment_counter(METRIC_SUBMIT_TOTAL, &[("outcome", outcome.as_str())], 1);
        tracing::debug!(client_id = %client_id, request_id = %request_id, outcome = outcome.as_str(), "Response received");
        Ok(outcome)
    }

    /// Terminate every session; every waiting dispatch fails with
    /// `Cancelled(Shutdown)`.
    pub fn shutdown(&self) -> usize {
        let closed = self.registry.close_all(CancelReason::Shutdown);
        self.correlator.cancel_all(CancelReason::Shutdown);
        self.update_client_gauge();
        tracing::info!(sessions = closed, "Relay shut down");
        closed
    }

    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry.sessions()
    }

    /// Requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.correlator.len()
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    fn on_disconnected(&self, client_id: &ClientId) {
        self.record_session_event("disconnected");
        self.update_client_gauge();
        tracing::info!(client_id = %client_id, "Client disconnected");
    }

    fn record_session_event(&self, event: &str) {
        self.metrics
            .increment_counter(METRIC_SESSION_EVENTS, &[("event", event)], 1);
    }

    fn update_client_gauge(&self) {
        self.metrics
            .set_gauge(METRIC_CONNECTED_CLIENTS, &[], self.registry.count() as i64);
    }
}

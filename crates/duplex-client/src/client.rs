use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duplex_core::{ClientId, Notice, PushFrame, Request, Response, SubmitOutcome};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::error::ClientError;
use crate::handler::RequestHandler;
use crate::sse::SseDecoder;

const CLIENT_ID_HEADER: &str = "Client-ID";
const RESPOND_TIMEOUT: Duration = Duration::from_secs(10);

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// HTTP client for a duplex relay.
#[derive(Clone, Debug)]
pub struct RelayClient {
    base_url: String,
    http: reqwest::Client,
    client_id: Option<ClientId>,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            client_id: None,
        }
    }

    /// Ask the server to register this client under a fixed id.
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open the push stream and wait for the server to announce the id.
    pub async fn subscribe(&self) -> Result<Subscription, ClientError> {
        let mut req = self
            .http
            .get(format!("{}/events", self.base_url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        if let Some(id) = &self.client_id {
            req = req.query(&[("client_id", id.as_str())]);
        }

        let resp = check_status(req.send().await?).await?;
        let mut frames = Frames {
            body: Box::pin(resp.bytes_stream()),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        };

        let client_id = loop {
            match frames.next().await? {
                Some(PushFrame::Notice(Notice::ClientId { id })) => break id,
                Some(PushFrame::Request(req)) => {
                    tracing::warn!(request_id = %req.id, "Request arrived before client id, dropping");
                }
                None => return Err(ClientError::NoClientId),
            }
        };
        tracing::info!(client_id = %client_id, "Subscribed to push stream");

        Ok(Subscription { client_id, frames })
    }

    /// Post a response for a pushed request.
    pub async fn respond(&self, client_id: &ClientId, response: &Response) -> Result<SubmitOutcome, ClientError> {
        let resp = self
            .http
            .post(format!("{}/response", self.base_url))
            .header(CLIENT_ID_HEADER, client_id.as_str())
            .timeout(RESPOND_TIMEOUT)
            .json(response)
            .send()
            .await?;

        #[derive(Deserialize)]
        struct Ack {
            outcome: SubmitOutcome,
        }
        let ack: Ack = check_status(resp).await?.json().await?;
        Ok(ack.outcome)
    }

    /// Subscribe and answer every pushed request with `handler` until the
    /// stream ends.
    pub async fn run(&self, handler: Arc<dyn RequestHandler>) -> Result<(), ClientError> {
        let mut subscription = self.subscribe().await?;
        let client_id = subscription.client_id().clone();

        while let Some(request) = subscription.next_request().await? {
            tracing::debug!(request_id = %request.id, method = %request.method, "Received request");
            let this = self.clone();
            let handler = Arc::clone(&handler);
            let client_id = client_id.clone();
            tokio::spawn(async move {
                let response = handler.handle(request).await;
                match this.respond(&client_id, &response).await {
                    Ok(outcome) => {
                        tracing::debug!(request_id = %response.id, outcome = outcome.as_str(), "Response sent")
                    }
                    Err(e) => tracing::warn!(request_id = %response.id, error = %e, "Failed to send response"),
                }
            });
        }

        tracing::info!(client_id = %client_id, "Push stream closed");
        Ok(())
    }

    /// Dispatch through `GET /trigger` and return the client's response.
    pub async fn trigger(
        &self,
        client_id: &ClientId,
        message: &str,
        method: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        let mut query: Vec<(&str, String)> = vec![
            ("client_id", client_id.to_string()),
            ("message", message.to_string()),
        ];
        if let Some(method) = method {
            query.push(("method", method.to_string()));
        }
        if let Some(timeout) = timeout {
            query.push(("timeout_ms", timeout.as_millis().to_string()));
        }

        let resp = self
            .http
            .get(format!("{}/trigger", self.base_url))
            .query(&query)
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status { status, body })
}

struct Frames {
    body: ByteStream,
    decoder: SseDecoder,
    ready: VecDeque<String>,
}

impl Frames {
    async fn next(&mut self) -> Result<Option<PushFrame>, ClientError> {
        loop {
            if let Some(data) = self.ready.pop_front() {
                return Ok(Some(PushFrame::parse(&data)?));
            }
            match self.body.next().await {
                Some(chunk) => self.ready.extend(self.decoder.push(&chunk?)?),
                None => return Ok(None),
            }
        }
    }
}

/// An open push stream.
pub struct Subscription {
    client_id: ClientId,
    frames: Frames,
}

impl Subscription {
    /// The id the server registered this session under.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Next decoded record, or `None` once the server closes the stream.
    pub async fn next_frame(&mut self) -> Result<Option<PushFrame>, ClientError> {
        self.frames.next().await
    }

    /// Next pushed request, skipping control records and records that do
    /// not decode.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ClientError> {
        loop {
            match self.next_frame().await {
                Ok(Some(PushFrame::Request(req))) => return Ok(Some(req)),
                Ok(Some(PushFrame::Notice(notice))) => {
                    tracing::debug!(?notice, "Ignoring notice");
                }
                Ok(None) => return Ok(None),
                Err(ClientError::Decode(e)) => {
                    tracing::warn!(error = %e, "Skipping malformed push record");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = RelayClient::new("http://localhost:8082/");
        assert_eq!(client.base_url(), "http://localhost:8082");
    }

    #[tokio::test]
    async fn frames_decode_notice_then_request() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"client_id\",\"id\":\"c1\"}\n\n:\n\n")),
            Ok(Bytes::from_static(b"data: {\"id\":\"req_1\",\"method\":\"analyze\",\"message\":\"hi\"}\n\n")),
        ];
        let mut frames = Frames {
            body: Box::pin(futures::stream::iter(chunks)),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        };

        assert_eq!(
            frames.next().await.unwrap(),
            Some(PushFrame::Notice(Notice::ClientId {
                id: ClientId::from_raw("c1")
            }))
        );
        match frames.next().await.unwrap() {
            Some(PushFrame::Request(req)) => assert_eq!(req.message, "hi"),
            other => panic!("expected request, got {other:?}"),
        }
        assert!(frames.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_record_is_decode_error() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![Ok(Bytes::from_static(b"data: {nope\n\n"))];
        let mut frames = Frames {
            body: Box::pin(futures::stream::iter(chunks)),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        };
        assert!(matches!(frames.next().await, Err(ClientError::Decode(_))));
    }
}

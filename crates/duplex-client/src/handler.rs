use std::time::Duration;

use async_trait::async_trait;
use duplex_core::{Request, Response};

/// Turns a pushed request into the response the client posts back.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Demo handler: describes the message for `analyze`, echoes it otherwise.
#[derive(Clone, Debug, Default)]
pub struct AnalyzeHandler {
    /// Simulated processing time before answering.
    pub delay: Duration,
}

impl AnalyzeHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

pub fn analyze(method: &str, message: &str) -> String {
    match method {
        "analyze" => format!(
            "Analysis result for '{message}': This message contains {} characters and appears to be a {method} request.",
            message.len()
        ),
        _ => format!("Processed '{message}' using method '{method}'"),
    }
}

#[async_trait]
impl RequestHandler for AnalyzeHandler {
    async fn handle(&self, request: Request) -> Response {
        tracing::debug!(request_id = %request.id, method = %request.method, "Processing request");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = analyze(&request.method, &request.message);
        Response::success(request.id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::{Payload, RequestId};

    #[test]
    fn analyze_text() {
        assert_eq!(
            analyze("analyze", "hello"),
            "Analysis result for 'hello': This message contains 5 characters and appears to be a analyze request."
        );
        assert_eq!(analyze("echo", "hi"), "Processed 'hi' using method 'echo'");
    }

    #[tokio::test(start_paused = true)]
    async fn handler_waits_for_delay() {
        let handler = AnalyzeHandler::new(Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        let req = Request::new(RequestId::from_raw("req_1"), Payload::new("analyze", "hello"));

        let resp = handler.handle(req).await;

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(resp.id.as_str(), "req_1");
        assert!(resp.result_str().unwrap().starts_with("Analysis result for 'hello'"));
    }
}

//! Wire shapes shared by the relay server and its clients.
//!
//! Every push record is one SSE `data:` line carrying either a [`Notice`] or a
//! [`Request`]. Responses travel back as whole JSON bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ClientId, RequestId};

/// What the initiator wants delivered to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub method: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Payload {
    pub fn new(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            message: message.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// A server-originated request pushed to one client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, payload: Payload) -> Self {
        Self {
            id,
            method: payload.method,
            message: payload.message,
            params: payload.params,
        }
    }
}

/// A client's answer to a [`Request`], matched by `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: RequestId, result: impl Into<Value>) -> Self {
        Self {
            id,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failure(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The result as a string, when the client answered with one.
    pub fn result_str(&self) -> Option<&str> {
        self.result.as_ref().and_then(|v| v.as_str())
    }
}

/// Control records the server sends on the push stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// First record of every stream: the id the session was registered under.
    ClientId { id: ClientId },
}

/// One decoded push record.
#[derive(Clone, Debug, PartialEq)]
pub enum PushFrame {
    Notice(Notice),
    Request(Request),
}

impl PushFrame {
    /// Decode the JSON carried by one `data:` line.
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(data)?;
        if value.get("type").is_some() {
            serde_json::from_value(value).map(Self::Notice)
        } else {
            serde_json::from_value(value).map(Self::Request)
        }
    }
}

/// Acknowledgement for a submitted response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// A pending dispatch received the response.
    Delivered,
    /// No pending request matched; the response was dropped.
    Unmatched,
}

impl SubmitOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Unmatched => "unmatched",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = Request::new(RequestId::from_raw("req_1"), Payload::new("analyze", "hello"));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"id": "req_1", "method": "analyze", "message": "hello"}));
    }

    #[test]
    fn request_carries_params_when_present() {
        let payload = Payload::new("analyze", "hello").with_params(json!({"depth": 2}));
        let req = Request::new(RequestId::from_raw("req_2"), payload);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["params"]["depth"], 2);
    }

    #[test]
    fn response_accepts_plain_result() {
        let resp: Response =
            serde_json::from_str(r#"{"id":"req_1","result":"Analysis complete: hello"}"#).unwrap();
        assert_eq!(resp.result_str(), Some("Analysis complete: hello"));
        assert!(!resp.is_error());
    }

    #[test]
    fn response_failure_serializes_error_only() {
        let resp = Response::failure(RequestId::from_raw("req_1"), "boom");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"error\":\"boom\""));
        assert!(!json.contains("result"));
        assert!(resp.is_error());
    }

    #[test]
    fn notice_wire_shape() {
        let notice = Notice::ClientId {
            id: ClientId::from_raw("c1"),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json, json!({"type": "client_id", "id": "c1"}));
    }

    #[test]
    fn push_frame_distinguishes_notice_and_request() {
        let frame = PushFrame::parse(r#"{"type":"client_id","id": "demo"}"#).unwrap();
        assert_eq!(
            frame,
            PushFrame::Notice(Notice::ClientId {
                id: ClientId::from_raw("demo")
            })
        );

        let frame = PushFrame::parse(r#"{"id":"req_9","method":"analyze","message":"hi"}"#).unwrap();
        match frame {
            PushFrame::Request(req) => {
                assert_eq!(req.id.as_str(), "req_9");
                assert_eq!(req.method, "analyze");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn push_frame_rejects_garbage() {
        assert!(PushFrame::parse("not json").is_err());
        assert!(PushFrame::parse(r#"{"type":"unknown"}"#).is_err());
    }
}

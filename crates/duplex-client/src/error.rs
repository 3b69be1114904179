#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed push record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("push stream closed before the client id arrived")]
    NoClientId,

    #[error("push record exceeds {limit} bytes without terminating")]
    RecordTooLarge { limit: usize },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Status { status, .. } => status.is_server_error(),
            Self::NoClientId => true,
            Self::Decode(_) | Self::RecordTooLarge { .. } => false,
        }
    }
}

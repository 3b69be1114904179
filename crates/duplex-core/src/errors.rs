use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::ClientId;

/// Why a session stopped accepting work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A newer connection registered the same client id.
    Replaced,
    /// The push stream ended or the session was unregistered.
    Disconnected,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replaced => f.write_str("client replaced"),
            Self::Disconnected => f.write_str("client disconnected"),
            Self::Shutdown => f.write_str("server shutting down"),
        }
    }
}

/// Failures surfaced to dispatch and submit callers.
///
/// Every variant is scoped to one client or one request. None is retried by
/// the relay itself.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("client not found: {0}")]
    ClientNotFound(ClientId),

    #[error("client {0} is busy: push queue full")]
    Backpressure(ClientId),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
}

impl RelayError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ClientNotFound(_) => "client_not_found",
            Self::Backpressure(_) => "backpressure",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::UnknownClient(_) => "unknown_client",
        }
    }

    /// Whether a caller could reasonably try the same call again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressure(_) | Self::Timeout(_) | Self::Cancelled(CancelReason::Replaced))
    }
}

//! Client side of the duplex relay: subscribe to the push stream, answer
//! requests, and trigger dispatches.

pub mod client;
pub mod error;
pub mod handler;
pub mod sse;

pub use client::{RelayClient, Subscription};
pub use error::ClientError;
pub use handler::{AnalyzeHandler, RequestHandler};
pub use sse::SseDecoder;

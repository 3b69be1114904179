pub mod errors;
pub mod ids;
pub mod messages;

pub use errors::{CancelReason, RelayError};
pub use ids::{ClientId, IdGenerator, IdStrategy, RequestId, SequentialIds, UuidIds};
pub use messages::{Notice, Payload, PushFrame, Request, Response, SubmitOutcome};

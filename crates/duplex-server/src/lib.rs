pub mod config;
pub mod correlator;
pub mod handlers;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stream;

pub use config::ServerConfig;
pub use relay::Relay;
pub use server::{build_router, start, AppState, ServerHandle};

use std::time::Duration;

use duplex_core::IdStrategy;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Requests buffered per client before dispatch reports backpressure.
    pub push_queue_capacity: usize,
    /// Wait applied when a dispatch does not ask for one.
    pub default_timeout: Duration,
    /// Upper bound on any requested wait.
    pub max_timeout: Duration,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_interval: Duration,
    pub id_strategy: IdStrategy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8082,
            push_queue_capacity: 10,
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            keep_alive_interval: Duration::from_secs(15),
            id_strategy: IdStrategy::Sequential,
        }
    }
}

impl ServerConfig {
    /// Resolve a caller-requested wait: absent or zero means the default,
    /// anything longer than `max_timeout` is clamped.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.max_timeout),
            _ => self.default_timeout,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

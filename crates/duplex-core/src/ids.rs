use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ClientId, "client");
branded_id!(RequestId, "req");

/// Source of request identifiers.
///
/// Identifiers must be unique among the requests currently awaiting a
/// response. Implementations never derive them from wall-clock time.
pub trait IdGenerator: Send + Sync {
    fn next_request_id(&self) -> RequestId;
}

/// Monotonic counter starting from a random offset, so ids from two server
/// runs are unlikely to overlap in client logs.
#[derive(Debug)]
pub struct SequentialIds {
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(u64::from(rand::random::<u32>()))
    }

    pub fn starting_at(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_request_id(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        RequestId::from_raw(format!("req_{n}"))
    }
}

/// UUIDv7-backed identifiers (`req_<uuid>`).
#[derive(Debug, Default)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_request_id(&self) -> RequestId {
        RequestId::new()
    }
}

/// Which [`IdGenerator`] the server should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdStrategy {
    #[default]
    Sequential,
    Uuid,
}

impl IdStrategy {
    pub fn generator(self) -> Box<dyn IdGenerator> {
        match self {
            Self::Sequential => Box::new(SequentialIds::new()),
            Self::Uuid => Box::new(UuidIds),
        }
    }
}

impl FromStr for IdStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "counter" => Ok(Self::Sequential),
            "uuid" | "random" => Ok(Self::Uuid),
            other => Err(format!("unknown id strategy: {other}")),
        }
    }
}

impl fmt::Display for IdStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Uuid => f.write_str("uuid"),
        }
    }
}

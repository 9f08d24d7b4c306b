use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_EXCHANGE: &str = "show";
pub const DEFAULT_GO_TOKEN: &str = "GO";

const DEFAULT_INBOX_CAPACITY: usize = 32;
const DEFAULT_PREEMPT_GRACE_MS: u64 = 500;
const DEFAULT_IDLE_FAULT_BACKOFF_MS: u64 = 100;

/// Name and numeric id of an element or trigger, rendered `name(id)` in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub id: u64,
}

impl Identity {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self { name: name.into(), id }
    }
}

impl core::fmt::Display for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Where the fan-out hub lives and which exchange to bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub exchange: String,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16, exchange: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            exchange: exchange.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, DEFAULT_EXCHANGE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementConfig {
    /// Commands buffered between delivery and the conductor.
    pub inbox_capacity: usize,
    /// How long a cancelled routine may take to return before it is aborted.
    pub preempt_grace: Duration,
    /// Pause after a faulted idle iteration before the next one.
    pub idle_fault_backoff: Duration,
    /// Start the idle routine as soon as the element is initialised.
    pub idle_on_start: bool,
}

impl Default for ElementConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            preempt_grace: Duration::from_millis(DEFAULT_PREEMPT_GRACE_MS),
            idle_fault_backoff: Duration::from_millis(DEFAULT_IDLE_FAULT_BACKOFF_MS),
            idle_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Offset applied to GO and IDLE so every element can receive before the deadline.
    pub sync_offset_ms: Option<u64>,
    pub go_token: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            sync_offset_ms: None,
            go_token: DEFAULT_GO_TOKEN.to_string(),
        }
    }
}
